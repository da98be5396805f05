//! End-to-end channel tests against the software falcon
//!
//! Most tests drive notifications by hand so the order of events is fixed;
//! the concurrency tests run the notifier thread.

mod common;

use common::{booted, booted_with, booted_with_notifier, config, eventually, recorder};
use pmu_chip::queue::{HPQ, LPQ, MSGQ, SWQ};
use pmu_chip::regs;
use pmu_chip::wire::{flags, hdr, mem_cmd, unit};
use pmu_driver::backends::{FalconGeometry, SoftwareFalcon};
use pmu_driver::wire::read_alloc;
use pmu_driver::{
    DmemAllocator, Payload, PmuChannel, PmuCmd, PmuError, PmuMsg, PmuTransport, RangeAllocator,
    Response, Result, SeqDesc, MAX_SEQUENCES,
};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(200);

// ── Basic traffic ────────────────────────────────────────────────────────────

#[test]
fn header_only_command_on_software_queue() {
    let rig = booted();
    let (done, rx) = recorder();

    let desc = rig
        .channel
        .post(PmuCmd::new(unit::SEQ, &[]), SWQ, done)
        .unwrap();

    let sent = rig.falcon.commands_seen().last().cloned().unwrap();
    assert_eq!(sent.queue, SWQ);
    assert_eq!(sent.hdr.size, 8);
    assert_eq!(sent.hdr.ctrl_flags, flags::STATUS | flags::INTR);

    rig.channel.on_notification();
    let (got, result) = rx.try_recv().unwrap();
    assert_eq!(got, desc);
    let resp = result.unwrap();
    assert_eq!(resp.msg.hdr.seq_id, sent.hdr.seq_id);
    assert_eq!(resp.msg.hdr.ctrl_flags & flags::PMU_MASK, 0);
    assert_eq!(resp.status(), Some(0));
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn descriptors_are_distinct_per_post() {
    let rig = booted();
    let mut seen = Vec::new();
    for _ in 0..5 {
        let (done, _rx) = recorder();
        seen.push(rig.channel.post(PmuCmd::new(unit::SEQ, &[1, 2, 3, 4]), HPQ, done).unwrap());
        rig.channel.on_notification();
    }
    let mut dedup = seen.clone();
    dedup.dedup();
    assert_eq!(dedup, seen);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn writer_wraps_around_small_queue() {
    let geometry = FalconGeometry::default().with_queue_size(SWQ, 64);
    let rig = booted_with(geometry, config());
    let swq = rig.falcon.geometry().queues[SWQ as usize];
    let head_reg = regs::queue_head(u32::from(swq.index));

    let post = |fill: u8| {
        let (done, rx) = recorder();
        rig.channel
            .post(PmuCmd::new(unit::SEQ, &[fill; 16]), SWQ, done)
            .unwrap();
        rig.channel.on_notification();
        assert!(rx.try_recv().unwrap().1.is_ok());
    };

    post(0);
    post(1);
    assert_eq!(rig.falcon.read_register(head_reg), swq.offset + 48);

    // 24 bytes no longer fit before the end: marker at 48, command at the base.
    post(2);
    assert_eq!(rig.falcon.read_register(head_reg), swq.offset + 24);
    let mut marker = [0u8; 8];
    rig.falcon.read_dmem(swq.offset + 48, &mut marker);
    assert_eq!(marker[hdr::UNIT_ID], unit::REWIND);
    let mut body = [0u8; 16];
    rig.falcon.read_dmem(swq.offset + 8, &mut body);
    assert_eq!(body, [2; 16]);

    for fill in 3..12 {
        post(fill);
    }
    let bodies: Vec<u8> = rig
        .falcon
        .commands_seen()
        .iter()
        .filter(|c| c.queue == SWQ)
        .map(|c| c.body[0])
        .collect();
    assert_eq!(bodies, (0..12).collect::<Vec<u8>>());
}

#[test]
fn message_queue_wraps_and_backlog_drains() {
    let geometry = FalconGeometry::default().with_queue_size(MSGQ, 0x80);
    let rig = booted_with(geometry, config());
    rig.falcon.set_auto_respond(false);

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let h = Arc::clone(&hits);
        rig.channel
            .post(PmuCmd::new(unit::SEQ, &[0; 4]), LPQ, move |_: SeqDesc, r: Result<Response>| {
                assert!(r.is_ok());
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    // 20 replies of 12 bytes do not fit a 128-byte ring at once.
    assert_eq!(rig.falcon.deliver_held(20), 20);
    for _ in 0..10 {
        rig.channel.on_notification();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 20);
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

// ── Sequence table ───────────────────────────────────────────────────────────

#[test]
fn exhaustion_is_exact_and_recovers_after_one_response() {
    let rig = booted();
    rig.falcon.set_auto_respond(false);

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 0..MAX_SEQUENCES {
        let c = Arc::clone(&completed);
        rig.channel
            .post(
                PmuCmd::new(unit::SEQ, &[]),
                [HPQ, LPQ, SWQ][i % 3],
                move |_: SeqDesc, _: Result<Response>| {
                    c.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }
    assert_eq!(rig.channel.sequences_in_use(), MAX_SEQUENCES);

    let (done, _rx) = recorder();
    assert!(matches!(
        rig.channel.post(PmuCmd::new(unit::SEQ, &[]), SWQ, done),
        Err(PmuError::SequenceExhausted)
    ));
    assert_eq!(rig.falcon.held_count(), MAX_SEQUENCES);

    assert_eq!(rig.falcon.deliver_held(1), 1);
    rig.channel.on_notification();
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(rig.channel.sequences_in_use(), MAX_SEQUENCES - 1);

    let (done, _rx) = recorder();
    rig.channel
        .post(PmuCmd::new(unit::SEQ, &[]), SWQ, done)
        .unwrap();
    // The freed slot (the first one posted) is the one handed out again.
    assert_eq!(rig.falcon.commands_seen().last().unwrap().hdr.seq_id, 0);
}

#[test]
fn response_for_free_slot_is_dropped() {
    let rig = booted();
    rig.falcon.set_auto_respond(false);

    let (done, rx) = recorder();
    let desc = rig
        .channel
        .post(PmuCmd::new(unit::SEQ, &[]), SWQ, done)
        .unwrap();
    let live = rig.falcon.commands_seen().last().unwrap().hdr.seq_id;

    rig.falcon
        .inject_message(&PmuMsg::new(unit::SEQ, 0, live.wrapping_add(7), &[0; 4]));
    rig.channel.on_notification();
    assert!(rx.try_recv().is_err());
    assert_eq!(rig.channel.sequences_in_use(), 1);

    rig.falcon.deliver_held(1);
    rig.channel.on_notification();
    let (got, result) = rx.try_recv().unwrap();
    assert_eq!(got, desc);
    assert!(result.is_ok());

    // A duplicate of the response that was just handled.
    rig.falcon
        .inject_message(&PmuMsg::new(unit::SEQ, 0, live, &[0; 4]));
    rig.channel.on_notification();
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn cancelled_command_frees_its_slot_silently() {
    let rig = booted();
    rig.falcon.set_auto_respond(false);

    let (done, rx) = recorder();
    let desc = rig
        .channel
        .post(PmuCmd::new(unit::SEQ, &[]), HPQ, done)
        .unwrap();
    rig.channel.cancel(desc).unwrap();
    assert!(matches!(
        rig.channel.cancel(desc),
        Err(PmuError::InvalidCommand { .. })
    ));
    assert_eq!(rig.channel.sequences_in_use(), 1);

    rig.falcon.deliver_held(1);
    rig.channel.on_notification();
    assert!(rx.try_recv().is_err());
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn cancel_of_unknown_descriptor_is_rejected() {
    let rig = booted();
    assert!(matches!(
        rig.channel.cancel(12_345),
        Err(PmuError::InvalidCommand { .. })
    ));
}

// ── Response errors ──────────────────────────────────────────────────────────

#[test]
fn oversized_response_reports_buffer_too_small() {
    let rig = booted();
    let (done, rx) = recorder();
    rig.channel
        .post_command(
            PmuCmd::new(unit::SEQ, &[]),
            Some(8),
            None,
            SWQ,
            Some(Box::new(done)),
            TIMEOUT,
        )
        .unwrap();
    rig.channel.on_notification();
    let (_, result) = rx.try_recv().unwrap();
    assert!(matches!(
        result,
        Err(PmuError::BufferTooSmall { needed: 12, capacity: 8 })
    ));
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn unhandled_command_is_reported() {
    let rig = booted();
    rig.falcon.set_unhandled(unit::I2C, true);
    let (done, rx) = recorder();
    rig.channel
        .post(PmuCmd::new(unit::I2C, &[0; 4]), LPQ, done)
        .unwrap();
    let seq = rig.falcon.commands_seen().last().unwrap().hdr.seq_id;
    rig.channel.on_notification();
    let (_, result) = rx.try_recv().unwrap();
    assert!(matches!(result, Err(PmuError::UnhandledCommand { seq: s }) if s == seq));
}

#[test]
fn invalid_unit_is_skipped_and_drain_continues() {
    let rig = booted();
    rig.falcon.set_auto_respond(false);
    let (done, rx) = recorder();
    rig.channel
        .post(PmuCmd::new(unit::SEQ, &[]), SWQ, done)
        .unwrap();

    rig.falcon.inject_message(&PmuMsg::new(0x30, 0, 0, &[0xaa; 12]));
    rig.falcon.deliver_held(1);
    rig.channel.on_notification();

    assert!(rx.try_recv().unwrap().1.is_ok());
    assert_eq!(
        rig.falcon.read_register(regs::MSGQ_TAIL),
        rig.falcon.read_register(regs::MSGQ_HEAD)
    );
}

#[test]
fn events_are_counted_not_dispatched() {
    let rig = booted();
    rig.falcon.inject_event(unit::PG, &[1, 2, 3, 4]);
    rig.falcon.inject_event(unit::SEQ, &[]);
    rig.channel.on_notification();
    assert_eq!(rig.channel.event_count(), 2);
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn event_flag_with_other_flags_is_a_response() {
    let rig = booted();
    rig.falcon.set_auto_respond(false);

    let (done, rx) = recorder();
    let desc = rig
        .channel
        .post(PmuCmd::new(unit::SEQ, &[]), SWQ, done)
        .unwrap();
    let live = rig.falcon.commands_seen().last().unwrap().hdr.seq_id;

    rig.falcon.inject_message(&PmuMsg::new(
        unit::SEQ,
        flags::EVENT | flags::STATUS | 0x10,
        live,
        &[0; 4],
    ));
    rig.channel.on_notification();

    let (got, result) = rx.try_recv().unwrap();
    assert_eq!(got, desc);
    assert!(result.is_ok());
    assert_eq!(rig.channel.event_count(), 0);
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

// ── Validation ───────────────────────────────────────────────────────────────

#[test]
fn invalid_commands_have_no_side_effects() {
    let rig = booted();
    let before = rig.falcon.commands_seen().len();

    let cases: Vec<(PmuCmd, Option<u32>, Option<Payload>, u32)> = vec![
        (PmuCmd::new(unit::SEQ, &[]), None, None, MSGQ),
        (PmuCmd::new(unit::SEQ, &[0; 200]), None, None, SWQ),
        (PmuCmd::new(unit::SEQ, &[]), Some(4), None, SWQ),
        (PmuCmd::new(unit::SEQ, &[0; 8]), None, Some(Payload::default()), SWQ),
        (PmuCmd::new(unit::SEQ, &[0; 8]), None, Some(Payload::input(Vec::<u8>::new(), 0)), SWQ),
        (PmuCmd::new(unit::SEQ, &[0; 8]), None, Some(Payload::input(vec![1u8], 4)), SWQ),
        (
            PmuCmd::mem_copy(),
            None,
            Some(Payload::input(vec![1u8], 0).with_output(0, 8)),
            SWQ,
        ),
        (
            PmuCmd::mem_copy(),
            None,
            Some(Payload { shared: true, ..Payload::input(vec![1u8], 0) }),
            SWQ,
        ),
    ];
    for (cmd, capacity, payload, queue) in cases {
        let err = rig
            .channel
            .post_command(cmd, capacity, payload, queue, None, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, PmuError::InvalidCommand { .. }), "{err}");
    }

    for bad in [unit::REWIND, unit::END, 0xff] {
        let err = rig
            .channel
            .post_command(PmuCmd::new(bad, &[]), None, None, SWQ, None, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, PmuError::InvalidUnit { unit: u } if u == bad));
    }

    assert_eq!(rig.falcon.commands_seen().len(), before);
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn post_before_init_message_is_not_ready() {
    let falcon = Arc::new(SoftwareFalcon::new());
    let channel = PmuChannel::new(falcon, config());
    channel.init().unwrap();
    let (done, _rx) = recorder();
    assert!(matches!(
        channel.post(PmuCmd::new(unit::SEQ, &[]), SWQ, done),
        Err(PmuError::NotReady)
    ));
    assert!(matches!(channel.queue_layout(SWQ), Err(PmuError::NotReady)));
}

// ── Payloads ─────────────────────────────────────────────────────────────────

fn post_mem(rig: &common::Rig, payload: Payload) -> (PmuCmd, Response) {
    let (done, rx) = recorder();
    rig.channel
        .post_command(
            PmuCmd::mem_copy(),
            None,
            Some(payload),
            LPQ,
            Some(Box::new(done)),
            TIMEOUT,
        )
        .unwrap();
    let sent = rig.falcon.commands_seen().last().cloned().unwrap();
    rig.channel.on_notification();
    let (_, result) = rx.try_recv().unwrap();
    (PmuCmd::new(sent.hdr.unit_id, &sent.body), result.unwrap())
}

#[test]
fn payload_round_trips_through_dmem() {
    let rig = booted();
    let data: Vec<u8> = (0u8..20).collect();
    let payload = Payload::input(data.clone(), mem_cmd::IN_ALLOC).with_output(20, mem_cmd::OUT_ALLOC);

    let (sent, resp) = post_mem(&rig, payload);
    let input = read_alloc(sent.body(), mem_cmd::IN_ALLOC).unwrap();
    let output = read_alloc(sent.body(), mem_cmd::OUT_ALLOC).unwrap();
    assert_eq!(input.size, 20);
    assert_eq!(output.size, 20);
    assert_ne!(input.offset, output.offset);

    let sw = rig.falcon.geometry();
    for r in [input, output] {
        assert!(r.offset >= sw.sw_area_offset);
        assert!(r.offset + r.size <= sw.sw_area_offset + sw.sw_area_size);
    }

    let expected: Vec<u8> = data.iter().map(|b| !b).collect();
    assert_eq!(resp.out_payload.as_deref(), Some(expected.as_slice()));
}

#[test]
fn aliased_payload_shares_one_region_sized_to_the_larger() {
    let rig = booted();
    let data = vec![0x5a_u8; 8];
    let payload = Payload::input(data, mem_cmd::IN_ALLOC)
        .with_output(16, mem_cmd::OUT_ALLOC)
        .aliased();

    let (sent, resp) = post_mem(&rig, payload);
    let input = read_alloc(sent.body(), mem_cmd::IN_ALLOC).unwrap();
    let output = read_alloc(sent.body(), mem_cmd::OUT_ALLOC).unwrap();
    assert_eq!(input.offset, output.offset);
    assert_eq!(input.size, 16);

    let out = resp.out_payload.unwrap();
    assert_eq!(out.len(), 16);
    assert_eq!(&out[..8], &[0xa5; 8]);
}

#[test]
fn payload_regions_are_released_every_time() {
    let rig = booted();
    // 2 KiB per command against a 16 KiB area: leaks would exhaust it quickly.
    for i in 0..64u8 {
        let payload = Payload::input(vec![i; 1024], mem_cmd::IN_ALLOC)
            .with_output(1024, mem_cmd::OUT_ALLOC);
        let (_, resp) = post_mem(&rig, payload);
        assert_eq!(resp.out_payload.unwrap()[0], !i);
    }
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn dmem_exhaustion_releases_the_slot() {
    let rig = booted();
    let area = rig.falcon.geometry().sw_area_size;
    let payload = Payload::input(vec![1u8; 16], mem_cmd::IN_ALLOC)
        .with_output(area, mem_cmd::OUT_ALLOC);
    let err = rig
        .channel
        .post_command(PmuCmd::mem_copy(), None, Some(payload), SWQ, None, TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, PmuError::DmemExhausted { .. }));
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[derive(Debug)]
struct CountingAllocator {
    inner: RangeAllocator,
    live: Arc<AtomicI64>,
}

impl DmemAllocator for CountingAllocator {
    fn alloc(&mut self, size: u32) -> pmu_driver::Result<u32> {
        let offset = self.inner.alloc(size)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(offset)
    }

    fn free(&mut self, offset: u32, size: u32) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.inner.free(offset, size);
    }
}

#[test]
fn custom_allocator_sees_balanced_alloc_and_free() {
    let falcon = Arc::new(SoftwareFalcon::new());
    let channel = PmuChannel::new(falcon.clone(), config());
    let live = Arc::new(AtomicI64::new(0));
    channel.set_allocator(Box::new(CountingAllocator {
        inner: RangeAllocator::new(0x2000, 0x1000),
        live: Arc::clone(&live),
    }));
    channel.init().unwrap();
    falcon.boot();
    channel.on_notification();
    channel.on_notification();

    let rig = common::Rig { falcon, channel };
    post_mem(
        &rig,
        Payload::input(vec![3u8; 32], mem_cmd::IN_ALLOC).with_output(32, mem_cmd::OUT_ALLOC),
    );
    post_mem(
        &rig,
        Payload::input(vec![3u8; 32], mem_cmd::IN_ALLOC)
            .with_output(8, mem_cmd::OUT_ALLOC)
            .aliased(),
    );
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn init_message_records_layout_and_gid() {
    let rig = booted();
    let g = rig.falcon.geometry();
    assert!(rig.channel.is_ready());
    assert_eq!(rig.channel.firmware_gid(), g.gid);
    for id in [HPQ, LPQ, SWQ, MSGQ] {
        let q = g.queues[id as usize];
        assert_eq!(
            rig.channel.queue_layout(id).unwrap(),
            (q.offset, u32::from(q.size))
        );
    }
}

#[test]
fn missing_gid_signature_is_tolerated() {
    let geometry = FalconGeometry {
        gid: None,
        ..FalconGeometry::default()
    };
    let rig = booted_with(geometry, config());
    assert!(rig.channel.is_ready());
    assert_eq!(rig.channel.firmware_gid(), None);
}

#[test]
fn shutdown_rejects_further_posts() {
    let rig = booted();
    rig.channel.shutdown();
    assert!(!rig.channel.is_ready());
    let (done, _rx) = recorder();
    assert!(matches!(
        rig.channel.post(PmuCmd::new(unit::SEQ, &[]), SWQ, done),
        Err(PmuError::NotReady)
    ));
    assert_eq!(rig.falcon.read_register(regs::IRQMASK), 0);
}

// ── Full queues ──────────────────────────────────────────────────────────────

/// Leave the firmware four bytes behind the head of `queue`, so no command
/// fits. Returns `(index, head)`.
fn jam_queue(rig: &common::Rig, queue: u32) -> (u32, u32) {
    let index = u32::from(rig.falcon.geometry().queues[queue as usize].index);
    let head = rig.falcon.read_register(regs::queue_head(index));
    rig.falcon.write_register(regs::queue_tail(index), head + 4);
    (index, head)
}

#[test]
fn post_to_full_queue_times_out_and_frees_its_slot() {
    let rig = booted();
    jam_queue(&rig, HPQ);
    let before = rig.falcon.commands_seen().len();

    let (done, rx) = recorder();
    let timeout = Duration::from_millis(50);
    let started = Instant::now();
    let err = rig
        .channel
        .post_command(
            PmuCmd::new(unit::SEQ, &[]),
            None,
            None,
            HPQ,
            Some(Box::new(done)),
            timeout,
        )
        .unwrap_err();

    assert!(matches!(err, PmuError::QueueFull { queue, .. } if queue == HPQ));
    assert!(started.elapsed() >= timeout);
    assert_eq!(rig.channel.sequences_in_use(), 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(rig.falcon.commands_seen().len(), before);
}

#[test]
fn post_waits_for_firmware_to_drain_a_full_queue() {
    let rig = booted();
    let (index, head) = jam_queue(&rig, HPQ);

    let falcon = Arc::clone(&rig.falcon);
    let drain_after = Duration::from_millis(30);
    let drainer = std::thread::spawn(move || {
        std::thread::sleep(drain_after);
        falcon.write_register(regs::queue_tail(index), head);
    });

    let (done, rx) = recorder();
    let started = Instant::now();
    let desc = rig
        .channel
        .post_command(
            PmuCmd::new(unit::SEQ, &[]),
            None,
            None,
            HPQ,
            Some(Box::new(done)),
            Duration::from_secs(2),
        )
        .unwrap();
    drainer.join().unwrap();
    assert!(started.elapsed() >= drain_after);

    rig.channel.on_notification();
    let (got, result) = rx.try_recv().unwrap();
    assert_eq!(got, desc);
    assert!(result.is_ok());
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[test]
fn concurrent_producers_all_complete() {
    let rig = booted_with_notifier(config());
    let completed = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|s| {
        for t in 0..4 {
            let channel = rig.channel.clone();
            let completed = Arc::clone(&completed);
            s.spawn(move || {
                for i in 0..50u8 {
                    let c = Arc::clone(&completed);
                    let queue = [HPQ, LPQ, SWQ][(t + usize::from(i)) % 3];
                    channel
                        .post_command(
                            PmuCmd::new(unit::SEQ, &[i; 8]),
                            None,
                            None,
                            queue,
                            Some(Box::new(move |_: SeqDesc, r: Result<Response>| {
                                assert!(r.is_ok());
                                c.fetch_add(1, Ordering::SeqCst);
                            })),
                            Duration::from_secs(2),
                        )
                        .unwrap();
                }
            });
        }
    });

    assert!(eventually(Duration::from_secs(5), || {
        completed.load(Ordering::SeqCst) == 200
    }));
    assert!(eventually(Duration::from_secs(1), || {
        rig.channel.sequences_in_use() == 0
    }));
    rig.channel.shutdown();
}

#[test]
fn concurrent_payload_posts_keep_dmem_copies_intact() {
    let rig = booted_with_notifier(config());

    std::thread::scope(|s| {
        for (t, queue) in [HPQ, LPQ, SWQ].into_iter().enumerate() {
            let channel = rig.channel.clone();
            s.spawn(move || {
                for i in 0..40u8 {
                    let data: Vec<u8> = (0..64u8).map(|b| b ^ i ^ (t as u8 * 0x55)).collect();
                    let expected: Vec<u8> = data.iter().map(|b| !b).collect();
                    let (done, rx) = recorder();
                    channel
                        .post_command(
                            PmuCmd::mem_copy(),
                            None,
                            Some(Payload::input(data, mem_cmd::IN_ALLOC).with_output(64, mem_cmd::OUT_ALLOC)),
                            queue,
                            Some(Box::new(done)),
                            Duration::from_secs(2),
                        )
                        .unwrap();
                    let (_, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
                    let resp = result.unwrap();
                    assert_eq!(resp.out_payload.as_deref(), Some(expected.as_slice()));
                }
            });
        }
    });

    assert!(eventually(Duration::from_secs(1), || {
        rig.channel.sequences_in_use() == 0
    }));
    rig.channel.shutdown();
}

#[test]
fn notifier_delivers_responses() {
    let rig = booted_with_notifier(config());
    let (done, rx) = recorder();
    let desc = rig
        .channel
        .post(PmuCmd::new(unit::SEQ, &[]), HPQ, done)
        .unwrap();
    let (got, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, desc);
    assert!(result.is_ok());
    rig.channel.shutdown();
}
