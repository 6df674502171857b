use super::*;

use crate::error::{CreateQueueError, EnqueueError};

#[test]
fn enqueue_persists_message() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "orders");
    let msg = test_message("orders");
    let msg_id = msg.id;
    let mut reply = send_enqueue(&tx, msg);

    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();

    assert_eq!(reply.try_recv().unwrap().unwrap(), msg_id);
    let stored = scheduler
        .storage()
        .get_message(&crate::storage::keys::message_key("orders", &msg_id))
        .unwrap()
        .expect("message should be persisted");
    assert_eq!(stored.delivery_count, 0);
    assert_eq!(stored.event.payload, vec![1, 2, 3]);
}

#[test]
fn enqueue_to_unknown_queue_returns_not_found() {
    let (tx, mut scheduler, _dir) = test_setup();

    let mut reply = send_enqueue(&tx, test_message("missing"));

    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();

    let err = reply.try_recv().unwrap().unwrap_err();
    assert!(
        matches!(err, EnqueueError::QueueNotFound(ref q) if q == "missing"),
        "expected QueueNotFound, got {err:?}"
    );
}

#[test]
fn create_queue_twice_returns_already_exists() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "dup");
    let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::CreateQueue {
        config: QueueConfig::new("dup"),
        reply: reply_tx,
    })
    .unwrap();

    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();

    let err = reply_rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(err, CreateQueueError::QueueAlreadyExists(_)));
}

#[test]
fn create_queue_rejects_retention_shorter_than_visibility() {
    let (tx, mut scheduler, _dir) = test_setup();

    let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
    tx.send(SchedulerCommand::CreateQueue {
        config: QueueConfig::new("bad")
            .with_visibility_timeout_ms(10_000)
            .with_retention_ms(5_000),
        reply: reply_tx,
    })
    .unwrap();

    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();

    let err = reply_rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(err, CreateQueueError::InvalidConfig(_)));
    assert!(scheduler.storage().get_queue("bad").unwrap().is_none());
}
