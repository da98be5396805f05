//! ELPG handshake tests against the software falcon

mod common;

use common::{booted, booted_with, booted_with_notifier, config, eventually};
use pmu_chip::queue::{HPQ, LPQ};
use pmu_chip::regs;
use pmu_chip::wire::{pg_cmd, unit, ENGINE_GR};
use pmu_driver::backends::{FalconGeometry, SeenCommand, SoftwareFalcon};
use pmu_driver::{ElpgState, PmuChannel, PmuError, PmuTransport};
use std::sync::Arc;
use std::time::Duration;

/// `(cmd_type, cmd)` of every PG command the firmware consumed.
fn pg_commands(seen: &[SeenCommand]) -> Vec<(u8, u16)> {
    seen.iter()
        .filter(|c| c.hdr.unit_id == unit::PG)
        .map(|c| (c.body[0], u16::from_le_bytes([c.body[2], c.body[3]])))
        .collect()
}

fn allow_count(falcon: &SoftwareFalcon) -> usize {
    pg_commands(&falcon.commands_seen())
        .iter()
        .filter(|c| **c == (pg_cmd::TYPE_ELPG_CMD, pg_cmd::ELPG_ALLOW))
        .count()
}

#[test]
fn boot_handshake_programs_thresholds_and_settles_off() {
    let rig = booted();
    let cfg = config();
    let engine = u32::from(ENGINE_GR);
    assert_eq!(
        rig.falcon.read_register(regs::pg_idlefilth(engine)),
        cfg.idle_threshold
    );
    assert_eq!(
        rig.falcon.read_register(regs::pg_ppuidlefilth(engine)),
        cfg.ppu_idle_threshold
    );

    let seen = rig.falcon.commands_seen();
    let queues: Vec<u32> = seen.iter().map(|c| c.queue).collect();
    assert_eq!(queues, vec![HPQ, LPQ, HPQ]);
    assert_eq!(
        pg_commands(&seen),
        vec![
            (pg_cmd::TYPE_ELPG_CMD, pg_cmd::ELPG_INIT),
            (pg_cmd::TYPE_PG_STAT, pg_cmd::STAT_ALLOC_DMEM),
            (pg_cmd::TYPE_ELPG_CMD, pg_cmd::ELPG_DISALLOW),
        ]
    );

    let status = rig.channel.power_gating_status();
    assert!(status.ready);
    assert!(status.enable_allowed);
    assert_eq!(status.state, ElpgState::Off);
    assert_eq!(status.stat_dmem_offset, rig.falcon.geometry().stat_offset);
}

#[test]
fn boot_handshake_times_out_without_firmware() {
    let falcon = Arc::new(SoftwareFalcon::new());
    let channel = PmuChannel::new(
        falcon,
        config().with_ack_timeout(Duration::from_millis(30)),
    );
    channel.init().unwrap();
    assert!(matches!(
        channel.wait_boot_handshake(),
        Err(PmuError::AckTimeout { .. })
    ));
    assert!(!channel.power_gating_status().enable_allowed);
}

#[test]
fn enable_needs_a_graphics_context() {
    let rig = booted();
    let before = rig.falcon.commands_seen().len();
    rig.channel.enable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::Off);
    assert_eq!(rig.falcon.commands_seen().len(), before);
}

#[test]
fn enable_sends_allow_and_ack_turns_it_on() {
    let rig = booted();
    rig.channel.set_context_ready(true);
    rig.channel.enable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::OnPending);
    assert_eq!(allow_count(&rig.falcon), 1);
    assert_eq!(rig.falcon.commands_seen().last().unwrap().queue, HPQ);

    rig.channel.on_notification();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::On);

    // Already on: nothing more to send.
    rig.channel.enable_power_gating().unwrap();
    assert_eq!(allow_count(&rig.falcon), 1);
}

#[test]
fn enable_then_disable_with_closed_gate_sends_nothing() {
    let falcon = Arc::new(SoftwareFalcon::new());
    let channel = PmuChannel::new(falcon.clone(), config());
    channel.init().unwrap();
    falcon.boot();
    channel.on_notification();
    channel.on_notification();
    // Handshake acked, but the gate has not been opened.
    assert!(channel.power_gating_status().ready);
    channel.set_context_ready(true);

    let before = falcon.commands_seen().len();
    channel.enable_power_gating().unwrap();
    assert_eq!(channel.power_gating_state(), ElpgState::OffOnPending);
    channel.disable_power_gating().unwrap();
    assert_eq!(channel.power_gating_state(), ElpgState::Off);
    assert_eq!(falcon.commands_seen().len(), before);
}

#[test]
fn disable_waits_for_ack_and_debounces_reenable() {
    let rig = booted_with_notifier(config().with_enable_allow_delay(Duration::from_millis(80)));
    rig.channel.set_context_ready(true);

    rig.channel.enable_power_gating().unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        rig.channel.power_gating_state() == ElpgState::On
    }));

    rig.channel.disable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::Off);
    let status = rig.channel.power_gating_status();
    assert!(!status.enable_allowed);
    assert!(status.timer_pending);

    // Inside the debounce window the request is parked.
    rig.channel.enable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::OffOnPending);
    assert_eq!(allow_count(&rig.falcon), 1);

    // When the window closes the parked enable is sent.
    assert!(eventually(Duration::from_secs(2), || {
        rig.channel.power_gating_state() == ElpgState::On
    }));
    assert_eq!(allow_count(&rig.falcon), 2);
    assert!(rig.channel.power_gating_status().enable_allowed);
    rig.channel.shutdown();
}

#[test]
fn disable_during_debounce_cancels_parked_enable() {
    let rig = booted_with_notifier(config().with_enable_allow_delay(Duration::from_millis(60)));
    rig.channel.set_context_ready(true);
    rig.channel.enable_power_gating().unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        rig.channel.power_gating_state() == ElpgState::On
    }));
    rig.channel.disable_power_gating().unwrap();

    rig.channel.enable_power_gating().unwrap();
    rig.channel.disable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::Off);

    assert!(eventually(Duration::from_secs(2), || {
        rig.channel.power_gating_status().enable_allowed
    }));
    assert_eq!(rig.channel.power_gating_state(), ElpgState::Off);
    assert_eq!(allow_count(&rig.falcon), 1);
    rig.channel.shutdown();
}

#[test]
fn disable_while_allow_in_flight_waits_for_it() {
    let rig = booted_with_notifier(config());
    rig.channel.set_context_ready(true);
    rig.falcon.set_auto_respond(false);
    rig.channel.enable_power_gating().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::OnPending);

    let channel = rig.channel.clone();
    let disabler = std::thread::spawn(move || channel.disable_power_gating());

    std::thread::sleep(Duration::from_millis(30));
    rig.falcon.set_auto_respond(true);
    assert_eq!(rig.falcon.deliver_held(1), 1);

    disabler.join().unwrap().unwrap();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::Off);
    let cmds = pg_commands(&rig.falcon.commands_seen());
    assert_eq!(
        &cmds[cmds.len() - 2..],
        &[
            (pg_cmd::TYPE_ELPG_CMD, pg_cmd::ELPG_ALLOW),
            (pg_cmd::TYPE_ELPG_CMD, pg_cmd::ELPG_DISALLOW),
        ]
    );
    rig.channel.shutdown();
}

#[test]
fn missing_disallow_ack_times_out_and_keeps_state() {
    let rig = booted_with(
        FalconGeometry::default(),
        config().with_ack_timeout(Duration::from_millis(40)),
    );
    rig.channel.set_context_ready(true);
    rig.channel.enable_power_gating().unwrap();
    rig.channel.on_notification();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::On);

    rig.falcon.set_auto_respond(false);
    assert!(matches!(
        rig.channel.disable_power_gating(),
        Err(PmuError::AckTimeout { .. })
    ));
    assert_eq!(rig.channel.power_gating_state(), ElpgState::On);
}

#[test]
fn shutdown_interrupts_a_blocked_disable() {
    let rig = booted_with_notifier(config().with_ack_timeout(Duration::from_secs(5)));
    rig.channel.set_context_ready(true);
    rig.channel.enable_power_gating().unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        rig.channel.power_gating_state() == ElpgState::On
    }));

    rig.falcon.set_auto_respond(false);
    let channel = rig.channel.clone();
    let disabler = std::thread::spawn(move || channel.disable_power_gating());
    assert!(eventually(Duration::from_secs(2), || rig.falcon.held_count() == 1));
    std::thread::sleep(Duration::from_millis(20));

    rig.channel.shutdown();
    assert!(matches!(
        disabler.join().unwrap(),
        Err(PmuError::Interrupted { .. })
    ));
}

#[test]
fn rejected_pg_command_leaves_state_alone() {
    let rig = booted();
    rig.channel.set_context_ready(true);
    rig.falcon.set_unhandled(unit::PG, true);
    rig.channel.enable_power_gating().unwrap();
    rig.channel.on_notification();
    assert_eq!(rig.channel.power_gating_state(), ElpgState::OnPending);
    assert_eq!(rig.channel.sequences_in_use(), 0);
}

#[test]
fn engine_buffer_load_reports_firmware_status() {
    let rig = booted_with_notifier(config());
    rig.channel
        .load_engine_buffer(pg_cmd::BUF_IDX_FECS, 0x1_2345_6700, 0x400)
        .unwrap();
    assert!(rig.channel.power_gating_status().buf_loaded);

    let sent = rig.falcon.commands_seen().last().cloned().unwrap();
    assert_eq!(sent.queue, LPQ);
    assert_eq!(sent.body[0], pg_cmd::TYPE_ENG_BUF_LOAD);
    assert_eq!(sent.body[2], pg_cmd::BUF_IDX_FECS);
    assert_eq!(u16::from_le_bytes([sent.body[4], sent.body[5]]), 0x400);

    assert!(matches!(
        rig.channel.load_engine_buffer(pg_cmd::BUF_IDX_ZBC, 0x1000, 0),
        Err(PmuError::Transport { .. })
    ));
    assert!(rig.channel.power_gating_status().buf_failed);
    rig.channel.shutdown();
}
