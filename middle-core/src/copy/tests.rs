use std::thread;

use rstest::{fixture, rstest};

use super::*;
use crate::backing::Value;
use crate::test_support::{Call, CallLog, RecordingStore};

struct Harness {
    log: CallLog,
    channel: BulkWriteChannel,
}

fn harness_with(batch_rows: usize) -> Harness {
    let log = CallLog::default();
    let config = WriterConfig {
        batch_rows,
        batch_bytes: usize::MAX,
        queue_depth: 1,
    };
    let channel = BulkWriteChannel::start(
        RecordingStore::new(log.clone()),
        TableSet::new("osm"),
        config,
    )
    .expect("start writer");
    Harness { log, channel }
}

#[fixture]
fn harness() -> Harness {
    harness_with(3)
}

fn row(n: usize) -> Vec<u8> {
    format!("{n}\t0\t0\t\\N").into_bytes()
}

fn stream_calls(log: &CallLog) -> Vec<Call> {
    log.calls()
        .into_iter()
        .filter(|call| !matches!(call, Call::Prepare(_)))
        .collect()
}

#[rstest]
fn rows_reach_the_store_in_enqueue_order(harness: Harness) {
    for n in 0..10 {
        harness
            .channel
            .enqueue(TableKind::Points, row(n))
            .expect("enqueue");
    }
    harness.channel.flush_barrier().expect("flush");

    let expected: Vec<_> = (0..10).map(row).collect();
    assert_eq!(harness.log.rows_for("osm_nodes"), expected);
}

#[rstest]
fn barrier_returns_after_partial_batches_are_durable(harness: Harness) {
    harness
        .channel
        .enqueue(TableKind::Ways, row(1))
        .expect("enqueue");
    assert!(harness.log.rows_for("osm_ways").is_empty(), "below batch size");

    harness.channel.flush_barrier().expect("flush");
    assert_eq!(
        stream_calls(&harness.log),
        vec![
            Call::Begin("osm_ways".into()),
            Call::Row("osm_ways".into(), row(1)),
            Call::End("osm_ways".into()),
        ]
    );
}

#[rstest]
fn concurrent_producers_keep_per_table_order() {
    let Harness { log, channel } = harness_with(7);
    thread::scope(|scope| {
        for table in TableKind::ALL {
            let channel = &channel;
            scope.spawn(move || {
                for n in 0..200 {
                    channel.enqueue(table, row(n)).expect("enqueue");
                }
            });
        }
    });
    channel.flush_barrier().expect("flush");

    let expected: Vec<_> = (0..200).map(row).collect();
    for table in ["osm_nodes", "osm_ways", "osm_rels"] {
        assert_eq!(log.rows_for(table), expected, "order for {table}");
    }
    let stats = channel.stop().expect("stop");
    for table in TableKind::ALL {
        assert_eq!(stats.committed(table), 200);
    }
}

#[rstest]
fn deletes_stay_in_stream_order(harness: Harness) {
    let channel = &harness.channel;
    channel.enqueue(TableKind::Points, row(1)).expect("enqueue");
    channel.enqueue_delete(TableKind::Points, 1).expect("delete");
    channel.enqueue(TableKind::Points, row(2)).expect("enqueue");
    channel.flush_barrier().expect("flush");

    assert_eq!(
        stream_calls(&harness.log),
        vec![
            Call::Begin("osm_nodes".into()),
            Call::Row("osm_nodes".into(), row(1)),
            Call::End("osm_nodes".into()),
            Call::Exec("osm_nodes_delete".into(), vec![Value::Integer(1)]),
            Call::Begin("osm_nodes".into()),
            Call::Row("osm_nodes".into(), row(2)),
            Call::End("osm_nodes".into()),
        ]
    );
}

#[rstest]
fn stream_failures_surface_once_and_abort_the_channel(harness: Harness) {
    harness.log.fail_at_row(1);
    for n in 0..2 {
        harness
            .channel
            .enqueue(TableKind::Relations, row(n))
            .expect("enqueue");
    }

    let err = harness.channel.flush_barrier().expect_err("injected failure");
    match err {
        WriteError::Stream {
            table,
            operation,
            committed_rows,
            ..
        } => {
            assert_eq!(table, "osm_rels");
            assert_eq!(operation, "stream row");
            assert_eq!(committed_rows, 0);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(harness.channel.is_failed());
    assert!(matches!(
        harness.channel.enqueue(TableKind::Points, row(9)),
        Err(WriteError::Aborted)
    ));
    assert!(matches!(harness.channel.stop(), Err(WriteError::Aborted)));
}

#[rstest]
fn stop_reports_stats_and_refuses_further_work(harness: Harness) {
    harness
        .channel
        .enqueue(TableKind::Points, row(1))
        .expect("enqueue");
    harness
        .channel
        .enqueue_delete(TableKind::Ways, 4)
        .expect("delete");

    let stats = harness.channel.stop().expect("stop");
    assert_eq!(stats.committed(TableKind::Points), 1);
    assert_eq!(stats.deleted(TableKind::Ways), 1);
    assert!(matches!(
        harness.channel.enqueue(TableKind::Points, row(2)),
        Err(WriteError::Stopped)
    ));
    assert!(matches!(harness.channel.stop(), Err(WriteError::Stopped)));
}

#[rstest]
#[case(WriterConfig { batch_rows: 2, batch_bytes: usize::MAX, queue_depth: 1 }, 2, true)]
#[case(WriterConfig { batch_rows: usize::MAX, batch_bytes: 8, queue_depth: 1 }, 1, true)]
#[case(WriterConfig { batch_rows: 3, batch_bytes: usize::MAX, queue_depth: 1 }, 2, false)]
fn batches_close_on_either_threshold(
    #[case] config: WriterConfig,
    #[case] rows: usize,
    #[case] full: bool,
) {
    let mut batch = worker::Batch::new(TableKind::Points);
    for n in 0..rows {
        batch.push(worker::Op::Row(row(n)));
    }
    assert_eq!(batch.is_full(&config), full);
}
