//! Frame queue behavior under pressure

mod common;

use std::sync::Arc;

use vesper_voice::audio::{AudioFrame, FrameGapDetector, FrameQueue, PushResult};

fn tagged(tag: i16) -> AudioFrame {
    AudioFrame::new(vec![tag; 8], 16_000)
}

#[test]
fn queue_never_exceeds_capacity() {
    let queue = FrameQueue::new(10);
    for i in 0..1_000_i16 {
        queue.push(tagged(i));
        assert!(queue.len() <= 10);
    }
    assert_eq!(queue.overruns(), 990);
}

#[test]
fn overflow_keeps_newest_frames_in_order() {
    let queue = FrameQueue::new(4);
    for i in 0..20_i16 {
        queue.push(tagged(i));
    }
    let mut tags = Vec::new();
    while let Some(frame) = queue.try_pop() {
        tags.push(frame.samples()[0]);
    }
    assert_eq!(tags, vec![16, 17, 18, 19]);
}

#[tokio::test]
async fn concurrent_producer_consumer_preserves_order() {
    let queue = Arc::new(FrameQueue::new(64));
    let producer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for i in 0..500_i16 {
                queue.push(tagged(i));
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            queue.close();
        })
    };

    let mut last = -1_i16;
    let mut received = 0usize;
    while let Some(frame) = queue.pop().await {
        let tag = frame.samples()[0];
        // drop-oldest may skip tags but never reorders them
        assert!(tag > last, "tag {tag} arrived after {last}");
        last = tag;
        received += 1;
    }
    producer.await.unwrap();
    assert!(received > 0);
    assert!(received <= 500);
}

#[tokio::test]
async fn close_during_blocked_pop_unblocks_consumer() {
    let queue = Arc::new(FrameQueue::new(8));
    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.pop().await })
    };
    tokio::task::yield_now().await;
    queue.close();
    assert!(consumer.await.unwrap().is_none());
}

#[test]
fn push_after_close_reports_closed() {
    let queue = FrameQueue::new(8);
    queue.close();
    assert_eq!(queue.push(tagged(1)), PushResult::Closed);
    assert!(queue.is_empty());
}

#[test]
fn overflow_leaves_a_gap_the_consumer_can_count() {
    let queue = FrameQueue::new(5);
    for seq in 0..8_u64 {
        let frame = AudioFrame::silence(8, 16_000)
            .stamped(seq, std::time::Duration::from_millis(seq * 32));
        queue.push(frame);
    }
    assert_eq!(queue.overruns(), 3);

    let mut gaps = FrameGapDetector::new();
    let mut missed = 0;
    while let Some(frame) = queue.try_pop() {
        missed += gaps.observe(frame.seq());
    }
    assert_eq!(missed, 3);
}

#[test]
fn clear_empties_without_closing() {
    let queue = FrameQueue::new(8);
    for i in 0..5_i16 {
        queue.push(tagged(i));
    }
    assert_eq!(queue.clear(), 5);
    assert!(!queue.is_closed());
    assert_eq!(queue.push(tagged(9)), PushResult::Accepted);
}
