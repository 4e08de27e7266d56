//! # Message Bus Unit Tests / 消息总线单元测试
//!
//! This module tests both bus variants directly: ordering under concurrent
//! publishers, the stop signal, flushing, and the stop-on-fail wrapper.
//!
//! 此模块直接测试两种总线：并发发布下的顺序、停止信号、刷新以及失败即停包装器。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use test_conductor::bus::{
    DirectMessageBus, MessageBus, MessageRecorder, MessageSink, QueuedMessageBus, StopOnFailSink,
};
use test_conductor::failure::Failure;
use test_conductor::messages::{MessageBody, MessageIds, MessageKind, RunnerMessage};

fn output(producer: usize, seq: usize) -> RunnerMessage {
    RunnerMessage::new(
        MessageIds {
            assembly: format!("p{producer}"),
            ..MessageIds::default()
        },
        MessageBody::TestOutput {
            output: seq.to_string(),
        },
    )
}

/// Per-producer sequence numbers in delivery order.
fn sequences(recorder: &MessageRecorder, producer: usize) -> Vec<usize> {
    recorder
        .messages()
        .into_iter()
        .filter(|m| m.ids.assembly == format!("p{producer}"))
        .filter_map(|m| match m.body {
            MessageBody::TestOutput { output } => output.parse().ok(),
            _ => None,
        })
        .collect()
}

fn publish_concurrently(bus: Arc<dyn MessageBus>, producers: usize, per_producer: usize) {
    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let bus = bus.clone();
            thread::spawn(move || {
                for seq in 0..per_producer {
                    assert!(bus.publish(output(p, seq)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    bus.flush();
}

#[cfg(test)]
mod ordering_tests {
    use super::*;

    #[test]
    fn test_direct_bus_preserves_per_publisher_order() {
        let recorder = Arc::new(MessageRecorder::new());
        publish_concurrently(Arc::new(DirectMessageBus::new(recorder.clone())), 4, 100);

        assert_eq!(recorder.messages().len(), 400);
        for p in 0..4 {
            assert_eq!(sequences(&recorder, p), (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_queued_bus_preserves_per_publisher_order() {
        let recorder = Arc::new(MessageRecorder::new());
        let bus = QueuedMessageBus::new(recorder.clone(), 8).unwrap();
        publish_concurrently(Arc::new(bus), 4, 100);

        assert_eq!(recorder.messages().len(), 400);
        for p in 0..4 {
            assert_eq!(sequences(&recorder, p), (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_full_queue_blocks_the_publisher() {
        let slow = Arc::new(|_: &RunnerMessage| {
            thread::sleep(Duration::from_millis(50));
            true
        });
        let bus = QueuedMessageBus::new(slow, 1).unwrap();

        let started = Instant::now();
        for seq in 0..3 {
            assert!(bus.publish(output(0, seq)));
        }
        // The third message waits for the first delivery to free the queue.
        assert!(started.elapsed() >= Duration::from_millis(40));
        bus.flush();
        assert!(started.elapsed() >= Duration::from_millis(140));
    }

    #[test]
    fn test_dropping_the_queued_bus_drains_it() {
        let recorder = Arc::new(MessageRecorder::new());
        {
            let bus = QueuedMessageBus::new(recorder.clone(), 2).unwrap();
            for seq in 0..20 {
                bus.publish(output(0, seq));
            }
        }
        assert_eq!(sequences(&recorder, 0), (0..20).collect::<Vec<_>>());
    }
}

#[cfg(test)]
mod stop_signal_tests {
    use super::*;

    fn failed() -> RunnerMessage {
        RunnerMessage::new(
            MessageIds::default(),
            MessageBody::test_failed(&Failure::new("error", "boom"), Default::default(), String::new()),
        )
    }

    #[test]
    fn test_direct_bus_returns_consumer_answer() {
        let bus = DirectMessageBus::new(Arc::new(|m: &RunnerMessage| m.kind() != MessageKind::Failed));
        assert!(bus.publish(output(0, 0)));
        assert!(!bus.publish(failed()));
        assert!(bus.publish(output(0, 1)));
    }

    #[test]
    fn test_stop_on_fail_sink_is_sticky() {
        let recorder = Arc::new(MessageRecorder::new());
        let sink = StopOnFailSink::new(recorder.clone());

        assert!(sink.on_message(&output(0, 0)));
        assert!(!sink.on_message(&failed()));
        assert!(!sink.on_message(&output(0, 1)));
        assert_eq!(recorder.messages().len(), 3);
    }

    #[test]
    fn test_recorder_filters_by_kind() {
        let recorder = MessageRecorder::new();
        recorder.on_message(&output(0, 0));
        recorder.on_message(&failed());
        assert_eq!(recorder.of_kind(MessageKind::Failed).len(), 1);
        assert_eq!(recorder.of_kind(MessageKind::Other).len(), 1);
    }

    #[test]
    fn test_messages_serialize_for_reporters() {
        let json = serde_json::to_value(failed()).unwrap();
        assert_eq!(json["body"]["TestFailed"]["cause"], "Exception");
        assert_eq!(json["body"]["TestFailed"]["error"]["messages"][0], "boom");
    }
}
