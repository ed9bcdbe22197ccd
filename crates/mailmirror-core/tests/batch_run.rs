//! Full batch runs: reconcile, push local tags, update the tag store and
//! the checkpoint.

#![allow(clippy::unwrap_used)]

mod support;

use std::path::Path;
use std::sync::Arc;

use mailmirror_core::codec::{self, Headers};
use mailmirror_core::{Archive, EngineConfig, MailboxIndex, RevisionCheckpoint, run_batch};
use support::{FakeStore, MockConnector, account, engine, message};

fn archive_path(config: &EngineConfig, raw: &[u8]) -> std::path::PathBuf {
    let (head, _) = codec::split_message(raw);
    let digest = codec::digest(&Headers::parse(head).unwrap());
    Archive::new(&config.archive_dir).path(&digest)
}

async fn index_uids(config: &EngineConfig, user: &str, mailbox: &str) -> Vec<(u32, u8)> {
    let id = account(user, &[mailbox]).mailbox_id(mailbox);
    MailboxIndex::load(&config.index_path(&id))
        .await
        .unwrap()
        .records()
        .iter()
        .map(|r| (r.uid(), r.flags()))
        .collect()
}

fn checkpoint(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn first_run_indexes_and_writes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 1, &["\\Seen"], message(1, "a"));
    connector.server.add("INBOX", 2, &[], message(2, "b"));
    let store = FakeStore::new("db", 10);

    let report = run_batch(
        Arc::clone(&config),
        &store,
        Arc::clone(&connector),
        vec![account("me@example.com", &["INBOX"])],
    )
    .await
    .unwrap();

    assert_eq!(report.accounts, 1);
    assert_eq!(report.mailboxes, 1);
    assert!(report.checkpoint_saved);
    assert_eq!(
        index_uids(&config, "me@example.com", "INBOX").await,
        vec![(1, 0x01), (2, 0x00)]
    );
    assert_eq!(store.lines(), vec!["-unread id:m1@example.com"]);
    assert_eq!(store.refreshes(), 1);
    assert_eq!(checkpoint(&config.checkpoint_file), "0\tdb\t10\n");
    assert!(connector.server.commands().contains(&"LOGOUT".to_string()));
}

#[tokio::test]
async fn vanished_message_is_tagged_offline() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 1, &[], message(1, "a"));
    connector.server.add("INBOX", 7, &[], message(7, "b"));
    let store = FakeStore::new("db", 10);
    let accounts = vec![account("me@example.com", &["INBOX"])];

    run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();
    assert!(store.lines().is_empty());

    connector.server.expunge("INBOX", 7);
    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts)
        .await
        .unwrap();

    assert_eq!(report.confirmed_deletions, 1);
    assert_eq!(store.lines(), vec!["+offline id:m7@example.com"]);
    assert_eq!(
        index_uids(&config, "me@example.com", "INBOX").await,
        vec![(1, 0)]
    );
}

#[tokio::test]
async fn message_kept_in_another_mailbox_is_not_tagged_offline() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 1, &[], message(1, "a"));
    connector.server.add("Archive", 3, &[], message(1, "a"));
    let store = FakeStore::new("db", 10);
    let accounts = vec![account("me@example.com", &["INBOX", "Archive"])];

    run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();
    connector.server.expunge("INBOX", 1);
    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();

    assert_eq!(report.confirmed_deletions, 0);
    assert!(store.lines().is_empty());

    connector.server.expunge("Archive", 3);
    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts)
        .await
        .unwrap();
    assert_eq!(report.confirmed_deletions, 1);
    assert_eq!(store.lines(), vec!["+offline id:m1@example.com"]);
}

#[tokio::test]
async fn returning_message_is_not_flagged_deleted_remotely() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 1, &[], message(1, "a"));
    let store = FakeStore::new("db", 10);
    let accounts = vec![account("me@example.com", &["INBOX"])];

    run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();
    connector.server.expunge("INBOX", 1);
    run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();
    assert_eq!(store.lines(), vec!["+offline id:m1@example.com"]);

    // Moved back from an untracked mailbox under a new UID. The store now
    // reports the offline marker as a change since the checkpoint.
    let path = archive_path(&config, &message(1, ""));
    store.set_status("db", 11);
    store.answer("lastmod:10.. and tag:offline", vec![path]);
    connector.server.add("INBOX", 2, &[], message(1, "a"));
    connector.server.clear_commands();

    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts)
        .await
        .unwrap();

    assert_eq!(report.pushed, 0);
    assert!(
        !connector
            .server
            .commands()
            .iter()
            .any(|c| c.starts_with("UID STORE"))
    );
    assert!(connector.server.flags("INBOX", 2).is_empty());
    assert!(store.queries().iter().all(|(q, _)| !q.contains("offline")));
    assert_eq!(
        index_uids(&config, "me@example.com", "INBOX").await,
        vec![(2, 0)]
    );
}

#[tokio::test]
async fn changed_store_identity_forces_a_full_scan() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    std::fs::write(&config.checkpoint_file, "5\told-db\t3\n").unwrap();
    let connector = Arc::new(MockConnector::default());
    connector.server.create("INBOX");
    let store = FakeStore::new("new-db", 20);

    let report = run_batch(
        Arc::clone(&config),
        &store,
        connector,
        vec![account("me@example.com", &["INBOX"])],
    )
    .await
    .unwrap();

    let queries = store.queries();
    assert_eq!(queries.len(), 5);
    for (query, identity) in &queries {
        assert!(!query.contains("lastmod"), "{query}");
        assert!(identity.is_none());
    }
    assert!(queries.iter().any(|(q, _)| q == "not tag:unread"));
    assert!(report.checkpoint_saved);
    assert_eq!(checkpoint(&config.checkpoint_file), "0\tnew-db\t20\n");
}

#[tokio::test]
async fn same_identity_queries_since_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    std::fs::write(&config.checkpoint_file, "5\tdb\t3\n").unwrap();
    let connector = Arc::new(MockConnector::default());
    connector.server.create("INBOX");
    let store = FakeStore::new("db", 9);

    run_batch(
        Arc::clone(&config),
        &store,
        connector,
        vec![account("me@example.com", &["INBOX"])],
    )
    .await
    .unwrap();

    let queries = store.queries();
    assert!(
        queries.contains(&("lastmod:3.. and tag:replied".to_string(), Some("db".to_string())))
    );
    assert!(
        queries.contains(&("lastmod:3.. and not tag:unread".to_string(), Some("db".to_string())))
    );
    assert_eq!(checkpoint(&config.checkpoint_file), "0\tdb\t9\n");
}

#[tokio::test]
async fn local_tags_are_pushed_as_remote_flags() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 4, &[], message(4, "a"));
    connector.server.add("INBOX", 5, &[], message(5, "b"));
    let store = FakeStore::new("db", 10);
    let accounts = vec![account("me@example.com", &["INBOX"])];

    run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();

    store.set_status("db", 12);
    store.answer(
        "lastmod:10.. and tag:flagged",
        vec![archive_path(&config, &message(4, ""))],
    );
    store.answer(
        "lastmod:10.. and not tag:unread",
        vec![
            archive_path(&config, &message(4, "")),
            archive_path(&config, &message(5, "")),
            dir.path().join("elsewhere/not-an-archive-file"),
        ],
    );
    connector.server.clear_commands();
    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts.clone())
        .await
        .unwrap();

    assert_eq!(report.pushed, 3);
    let commands = connector.server.commands();
    assert!(commands.contains(&"UID STORE 4,5 +FLAGS \\Seen".to_string()));
    assert!(commands.contains(&"UID STORE 4 +FLAGS \\Flagged".to_string()));
    assert_eq!(
        connector.server.flags("INBOX", 4),
        vec!["\\Seen".to_string(), "\\Flagged".to_string()]
    );
    assert_eq!(
        index_uids(&config, "me@example.com", "INBOX").await,
        vec![(4, 0x11), (5, 0x01)]
    );

    // The flags now agree on both sides, so the next run neither pushes
    // nor emits tag updates.
    let before = store.lines().len();
    let report = run_batch(Arc::clone(&config), &store, Arc::clone(&connector), accounts)
        .await
        .unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(store.lines().len(), before);
}

#[tokio::test]
async fn failed_account_keeps_the_old_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(engine(dir.path()));
    std::fs::write(&config.checkpoint_file, "1\tdb\t2\n").unwrap();
    let connector = Arc::new(MockConnector::default());
    connector.server.add("INBOX", 1, &[], message(1, "a"));
    connector.server.refuse("broken@example.com");
    let store = FakeStore::new("db", 8);

    let report = run_batch(
        Arc::clone(&config),
        &store,
        Arc::clone(&connector),
        vec![
            account("broken@example.com", &["INBOX"]),
            account("me@example.com", &["INBOX"]),
        ],
    )
    .await
    .unwrap();

    assert_eq!(report.failed_accounts, 1);
    assert_eq!(report.mailboxes, 1);
    assert!(!report.checkpoint_saved);
    assert_eq!(checkpoint(&config.checkpoint_file), "1\tdb\t2\n");
    assert_eq!(
        index_uids(&config, "me@example.com", "INBOX").await,
        vec![(1, 0)]
    );
}
