use super::*;

#[test]
fn recovery_preserves_messages_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(dir.path()).unwrap());

    // Phase 1: enqueue messages, then shut down the scheduler
    let (tx, mut scheduler) = test_setup_with_storage(Arc::clone(&storage));
    send_create_queue(&tx, "recover-queue");
    let mut msg_ids = Vec::new();
    for _ in 0..5 {
        let msg = test_message("recover-queue");
        msg_ids.push(msg.id);
        send_enqueue(&tx, msg);
    }
    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();
    drop(tx);

    // Phase 2: a brand-new scheduler on the same storage
    let (tx2, mut scheduler2) = test_setup_with_storage(Arc::clone(&storage));
    let mut rx = send_receive(&tx2, "recover-queue", 10);
    tx2.send(SchedulerCommand::Shutdown).unwrap();
    scheduler2.run();

    let received: Vec<Uuid> = rx
        .try_recv()
        .unwrap()
        .unwrap()
        .iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(received, msg_ids, "all messages survive restart in FIFO order");
}

#[test]
fn recovery_reclaims_expired_leases() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(dir.path()).unwrap());

    // Simulate a crash while a message was in flight with a lease already
    // past its expiry.
    storage
        .put_queue("reclaim-queue", &QueueConfig::new("reclaim-queue"))
        .unwrap();
    let mut msg = test_message("reclaim-queue");
    msg.delivery_count = 1;
    let msg_id = msg.id;
    storage
        .write_batch(vec![
            WriteBatchOp::PutMessage {
                key: keys::message_key("reclaim-queue", &msg_id),
                value: serde_json::to_vec(&msg).unwrap(),
            },
            WriteBatchOp::PutLease {
                key: keys::lease_key("reclaim-queue", &msg_id),
                value: keys::lease_value(1, 1),
            },
            WriteBatchOp::PutLeaseExpiry {
                key: keys::lease_expiry_key(1, "reclaim-queue", &msg_id),
            },
        ])
        .unwrap();

    let (tx, mut scheduler) = test_setup_with_storage(Arc::clone(&storage));
    let mut rx = send_receive(&tx, "reclaim-queue", 1);
    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();

    let batch = rx.try_recv().unwrap().unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].message_id, msg_id);
    assert_eq!(batch[0].delivery_count, 2);
}

#[test]
fn recovery_keeps_unexpired_leases_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(dir.path()).unwrap());

    let (tx, mut scheduler) = test_setup_with_storage(Arc::clone(&storage));
    send_create_queue(&tx, "inflight");
    send_enqueue(&tx, test_message("inflight"));
    let mut first = send_receive(&tx, "inflight", 1);
    tx.send(SchedulerCommand::Shutdown).unwrap();
    scheduler.run();
    let leased = first.try_recv().unwrap().unwrap().remove(0);
    drop(tx);

    let (tx2, mut scheduler2) = test_setup_with_storage(Arc::clone(&storage));
    let mut again = send_receive(&tx2, "inflight", 1);
    let mut ack = send_ack(&tx2, &leased.receipt_handle);
    tx2.send(SchedulerCommand::Shutdown).unwrap();
    scheduler2.run();

    assert!(again.try_recv().unwrap().unwrap().is_empty());
    assert!(ack.try_recv().unwrap().is_ok(), "receipt survives restart");
}
