use super::*;

use crate::error::AckError;

#[test]
fn ack_removes_message_lease_and_expiry() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "ack-queue");
    send_enqueue(&tx, test_message("ack-queue"));
    scheduler.handle_all_pending();

    let msg = receive_one(&tx, &mut scheduler, "ack-queue");
    let mut ack = send_ack(&tx, &msg.receipt_handle);
    scheduler.handle_all_pending();
    assert!(ack.try_recv().unwrap().is_ok());

    let storage = scheduler.storage();
    let msg_key = crate::storage::keys::message_key("ack-queue", &msg.message_id);
    assert!(
        storage.get_message(&msg_key).unwrap().is_none(),
        "message should be deleted after ack"
    );
    let lease_key = crate::storage::keys::lease_key("ack-queue", &msg.message_id);
    assert!(
        storage.get_lease(&lease_key).unwrap().is_none(),
        "lease should be deleted after ack"
    );
    let expired = storage
        .list_expired_leases(&crate::storage::keys::lease_expiry_upper_bound(u64::MAX))
        .unwrap();
    assert!(expired.is_empty(), "lease expiry should be deleted after ack");
}

#[test]
fn ack_same_receipt_twice_returns_not_found() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "double-ack");
    send_enqueue(&tx, test_message("double-ack"));
    scheduler.handle_all_pending();
    let msg = receive_one(&tx, &mut scheduler, "double-ack");

    let mut first = send_ack(&tx, &msg.receipt_handle);
    let mut second = send_ack(&tx, &msg.receipt_handle);
    scheduler.handle_all_pending();

    assert!(first.try_recv().unwrap().is_ok());
    let err = second.try_recv().unwrap().unwrap_err();
    assert!(
        matches!(err, AckError::ReceiptNotFound(_)),
        "expected ReceiptNotFound, got {err:?}"
    );
}

#[test]
fn ack_with_fabricated_delivery_returns_not_found() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "forged");
    send_enqueue(&tx, test_message("forged"));
    scheduler.handle_all_pending();
    let msg = receive_one(&tx, &mut scheduler, "forged");

    let forged = ReceiptHandle::new("forged", msg.message_id, 7);
    let mut ack = send_ack(&tx, &forged);
    scheduler.handle_all_pending();

    let err = ack.try_recv().unwrap().unwrap_err();
    assert!(matches!(err, AckError::ReceiptNotFound(_)));
}

#[test]
fn ack_with_earlier_delivery_is_stale() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue_with(&tx, QueueConfig::new("stale").with_visibility_timeout_ms(20));
    send_enqueue(&tx, test_message("stale"));
    scheduler.handle_all_pending();

    let first = receive_one(&tx, &mut scheduler, "stale");
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(scheduler.reclaim_expired_leases(), 1);
    let second = receive_one(&tx, &mut scheduler, "stale");
    assert_eq!(second.delivery_count, 2);

    let mut stale = send_ack(&tx, &first.receipt_handle);
    let mut current = send_ack(&tx, &second.receipt_handle);
    scheduler.handle_all_pending();

    let err = stale.try_recv().unwrap().unwrap_err();
    assert!(
        matches!(err, AckError::StaleReceipt(_)),
        "expected StaleReceipt, got {err:?}"
    );
    assert!(current.try_recv().unwrap().is_ok());
}

#[test]
fn ack_after_lapse_without_redelivery_is_honored() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue_with(&tx, QueueConfig::new("lapsed").with_visibility_timeout_ms(20));
    send_enqueue(&tx, test_message("lapsed"));
    scheduler.handle_all_pending();

    let msg = receive_one(&tx, &mut scheduler, "lapsed");
    std::thread::sleep(Duration::from_millis(30));
    scheduler.reclaim_expired_leases();

    let mut ack = send_ack(&tx, &msg.receipt_handle);
    scheduler.handle_all_pending();
    assert!(ack.try_recv().unwrap().is_ok());

    // The visible copy went with it.
    let mut rx = send_receive(&tx, "lapsed", 1);
    scheduler.handle_all_pending();
    assert!(rx.try_recv().unwrap().unwrap().is_empty());
}
