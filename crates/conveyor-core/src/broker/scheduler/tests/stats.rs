use super::*;

use crate::error::StatsError;

#[test]
fn stats_report_depth_in_flight_and_waiters() {
    let (tx, mut scheduler, _dir) = test_setup();

    send_create_queue(&tx, "busy");
    send_create_queue(&tx, "idle");
    for _ in 0..3 {
        send_enqueue(&tx, test_message("busy"));
    }
    scheduler.handle_all_pending();
    receive_one(&tx, &mut scheduler, "busy");
    let _parked = send_receive_wait(&tx, "idle", 1, Duration::from_secs(30));
    scheduler.handle_all_pending();

    let busy = scheduler.handle_get_stats("busy").unwrap();
    assert_eq!(busy.depth, 2);
    assert_eq!(busy.in_flight, 1);
    assert_eq!(busy.waiting_receivers, 0);

    let idle = scheduler.handle_get_stats("idle").unwrap();
    assert_eq!(idle.depth, 0);
    assert_eq!(idle.waiting_receivers, 1);

    let names: Vec<String> = scheduler
        .handle_list_queues()
        .unwrap()
        .into_iter()
        .map(|s| s.queue_id)
        .collect();
    assert_eq!(names, vec!["busy".to_string(), "idle".to_string()]);
}

#[test]
fn stats_for_unknown_queue_returns_not_found() {
    let (_tx, scheduler, _dir) = test_setup();

    let err = scheduler.handle_get_stats("ghost").unwrap_err();
    assert!(matches!(err, StatsError::QueueNotFound(_)));
}
