//! `pmu`: command-line tools for the falcon PMU channel.
//!
//! ```text
//! USAGE:
//!   pmu simulate [--commands N]      Boot the software falcon and exercise the channel
//!   pmu regs                         Print the PWR register map
//!   pmu probe <pcie-addr>            Read PMU registers through a mapped BAR
//!   pmu probe --path <file>          Same, from an arbitrary register aperture file
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pmu_chip::queue::{HPQ, LPQ, MSGQ, SWQ};
use pmu_chip::regs;
use pmu_chip::wire::{mem_cmd, pg_cmd, unit};
use pmu_driver::backends::{MmioTransport, SoftwareFalcon};
use pmu_driver::{
    ChannelConfig, ElpgState, Payload, PmuChannel, PmuCmd, PmuTransport, Response, SeqDesc,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pmu", about = "Falcon PMU command/response channel tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Boot the in-process falcon, post commands and run a power-gating cycle.
    Simulate {
        /// Commands to post on each command queue.
        #[arg(long, default_value_t = 16)]
        commands: usize,
        /// Power-gating acknowledgement timeout in milliseconds.
        #[arg(long, default_value_t = 2000)]
        ack_timeout_ms: u64,
        /// Debounce before power gating may be re-enabled, in milliseconds.
        #[arg(long, default_value_t = 500)]
        enable_delay_ms: u64,
    },
    /// Print the PWR register map.
    Regs,
    /// Read PMU interrupt, queue and mutex registers from a mapped BAR0.
    Probe {
        /// PCIe address (e.g. 0000:01:00.0).
        pcie_addr: Option<String>,
        /// PCI resource index to map.
        #[arg(long, default_value_t = 0)]
        resource: usize,
        /// Map this file instead of a PCI resource.
        #[arg(long, conflicts_with = "pcie_addr")]
        path: Option<std::path::PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Simulate {
            commands,
            ack_timeout_ms,
            enable_delay_ms,
        } => {
            let config = ChannelConfig::default()
                .with_ack_timeout(Duration::from_millis(ack_timeout_ms))
                .with_enable_allow_delay(Duration::from_millis(enable_delay_ms));
            cmd_simulate(commands, config)?;
        }
        Cmd::Regs => cmd_regs(),
        Cmd::Probe {
            pcie_addr,
            resource,
            path,
        } => cmd_probe(pcie_addr.as_deref(), resource, path.as_deref())?,
    }

    Ok(())
}

fn cmd_simulate(commands: usize, config: ChannelConfig) -> Result<()> {
    let falcon = Arc::new(SoftwareFalcon::new());
    let irq = falcon.connect_irq();
    let channel = PmuChannel::new(falcon.clone(), config.clone());

    channel.init()?;
    channel.start_notifier(irq)?;
    let started = Instant::now();
    falcon.boot();
    channel
        .wait_boot_handshake()
        .context("firmware did not finish the boot handshake")?;

    tracing::info!("software falcon booted");
    println!("Booted in {:?}", started.elapsed());
    for (name, id) in [("HPQ", HPQ), ("LPQ", LPQ), ("SWQ", SWQ), ("MSGQ", MSGQ)] {
        let (offset, size) = channel.queue_layout(id)?;
        println!("  {name:<5} DMEM {offset:#06x}  {size:>4} bytes");
    }
    if let Some(gid) = channel.firmware_gid() {
        println!("  GID   {}", String::from_utf8_lossy(&gid));
    }
    let pg = channel.power_gating_status();
    println!("  PG    stats at {:#06x}, state {:?}", pg.stat_dmem_offset, pg.state);
    println!();

    // Header-only traffic on every command queue.
    let (tx, rx) = mpsc::channel::<(SeqDesc, pmu_driver::Result<Response>)>();
    let started = Instant::now();
    let mut posted = 0usize;
    for queue in [HPQ, LPQ, SWQ] {
        for _ in 0..commands {
            let tx = tx.clone();
            channel.post(PmuCmd::new(unit::SEQ, &[]), queue, move |d: SeqDesc, r: pmu_driver::Result<Response>| {
                let _ = tx.send((d, r));
            })?;
            posted += 1;
        }
    }
    let mut failed = 0usize;
    for _ in 0..posted {
        let (desc, result) = rx
            .recv_timeout(config.ack_timeout)
            .context("response never arrived")?;
        if let Err(e) = result {
            eprintln!("  command {desc} failed: {e}");
            failed += 1;
        }
    }
    println!(
        "Commands     : {posted} posted, {} ok, {failed} failed in {:?}",
        posted - failed,
        started.elapsed()
    );

    // DMEM payload loopback.
    let data: Vec<u8> = (0u8..64).collect();
    let payload = Payload::input(data.clone(), mem_cmd::IN_ALLOC)
        .with_output(64, mem_cmd::OUT_ALLOC);
    let tx2 = tx.clone();
    channel.post_command(
        PmuCmd::mem_copy(),
        None,
        Some(payload),
        LPQ,
        Some(Box::new(move |d: SeqDesc, r: pmu_driver::Result<Response>| {
            let _ = tx2.send((d, r));
        })),
        config.command_timeout,
    )?;
    let (_, result) = rx.recv_timeout(config.ack_timeout)?;
    let resp = result?;
    let expected: Vec<u8> = data.iter().map(|b| !b).collect();
    match resp.out_payload.as_deref() {
        Some(out) if out == expected.as_slice() => {
            println!("Payload      : {} bytes round-tripped through DMEM", out.len());
        }
        other => bail!("payload mismatch: got {other:?}"),
    }

    // Power-gating cycle.
    channel.set_context_ready(true);
    channel.load_engine_buffer(pg_cmd::BUF_IDX_FECS, 0x10_0000, 0x100)?;
    channel.enable_power_gating()?;
    wait_state(&channel, ElpgState::On, config.ack_timeout)?;
    channel.disable_power_gating()?;
    println!(
        "Power gating : on → off, re-enable in {:?}",
        config.enable_allow_delay
    );
    channel.enable_power_gating()?;
    println!("               parked as {:?}", channel.power_gating_state());
    wait_state(
        &channel,
        ElpgState::On,
        config.enable_allow_delay + config.ack_timeout,
    )?;
    channel.disable_power_gating()?;
    println!("               re-enabled after debounce, now {:?}", channel.power_gating_state());

    println!("Events       : {}", channel.event_count());
    println!("In flight    : {}", channel.sequences_in_use());
    channel.shutdown();
    Ok(())
}

fn wait_state(
    channel: &PmuChannel,
    want: ElpgState,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while channel.power_gating_state() != want {
        if Instant::now() >= deadline {
            bail!(
                "power gating stuck in {:?} (wanted {want:?})",
                channel.power_gating_state()
            );
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

fn cmd_regs() {
    println!("Falcon interrupts");
    for (name, addr) in [
        ("IRQSSET", regs::IRQSSET),
        ("IRQSCLR", regs::IRQSCLR),
        ("IRQSTAT", regs::IRQSTAT),
        ("IRQMSET", regs::IRQMSET),
        ("IRQMCLR", regs::IRQMCLR),
        ("IRQMASK", regs::IRQMASK),
        ("IRQDEST", regs::IRQDEST),
    ] {
        println!("  {addr:#010x}  {name}");
    }
    println!("  IRQMSET at init = {:#010x}", regs::irq::HOST_ENABLED);
    println!("  IRQDEST at init = {:#010x}", regs::irqdest::HOST_DEFAULT);

    println!("DMEM ports");
    for port in 0..regs::DMEM_PORT_COUNT {
        println!(
            "  {:#010x}  DMEMC{port}    {:#010x}  DMEMD{port}",
            regs::dmemc(port),
            regs::dmemd(port)
        );
    }

    println!("Queues");
    for index in 0..regs::QUEUE_REG_COUNT {
        println!(
            "  {:#010x}  QUEUE_HEAD{index}  {:#010x}  QUEUE_TAIL{index}",
            regs::queue_head(index),
            regs::queue_tail(index)
        );
    }
    println!("  {:#010x}  MSGQ_HEAD     {:#010x}  MSGQ_TAIL", regs::MSGQ_HEAD, regs::MSGQ_TAIL);

    println!("Mutexes");
    println!("  {:#010x}  MUTEX_ID", regs::MUTEX_ID);
    println!("  {:#010x}  MUTEX_ID_RELEASE", regs::MUTEX_ID_RELEASE);
    for index in 0..regs::MUTEX_COUNT {
        println!("  {:#010x}  MUTEX{index}", regs::mutex(index));
    }

    println!("Power gating");
    println!("  {:#010x}  PG_IDLEFILTH(GR)", regs::pg_idlefilth(0));
    println!("  {:#010x}  PG_PPUIDLEFILTH(GR)", regs::pg_ppuidlefilth(0));
}

fn cmd_probe(
    pcie_addr: Option<&str>,
    resource: usize,
    path: Option<&std::path::Path>,
) -> Result<()> {
    let io = match (pcie_addr, path) {
        (_, Some(path)) => MmioTransport::open(path)?,
        (Some(addr), None) => MmioTransport::pci(addr, resource)?,
        (None, None) => bail!("give a PCIe address or --path"),
    };
    tracing::debug!("probing {}", io.path().display());
    println!("Aperture     : {} ({:#x} bytes)", io.path().display(), io.size());
    if io.size() < regs::APERTURE_SIZE {
        println!("               (smaller than the PWR block, high registers read as {:#x})", u32::MAX);
    }

    println!("IRQSTAT      : {:#010x}", io.read_register(regs::IRQSTAT));
    println!("IRQMASK      : {:#010x}", io.read_register(regs::IRQMASK));
    println!("IRQDEST      : {:#010x}", io.read_register(regs::IRQDEST));
    println!("IDLESTATE    : {:#010x}", io.read_register(regs::IDLESTATE));
    println!("OS           : {:#010x}", io.read_register(regs::OS));

    for index in 0..regs::QUEUE_REG_COUNT {
        println!(
            "QUEUE{index}       : head {:#010x}  tail {:#010x}",
            io.read_register(regs::queue_head(index)),
            io.read_register(regs::queue_tail(index))
        );
    }
    println!(
        "MSGQ         : head {:#010x}  tail {:#010x}",
        io.read_register(regs::MSGQ_HEAD),
        io.read_register(regs::MSGQ_TAIL)
    );

    let held: Vec<String> = (0..regs::MUTEX_COUNT)
        .filter_map(|i| {
            let owner = io.read_register(regs::mutex(i)) & regs::mutex_bits::VALUE_MASK;
            (owner != regs::mutex_bits::INITIAL_LOCK).then(|| format!("{i}={owner:#04x}"))
        })
        .collect();
    if held.is_empty() {
        println!("Mutexes      : all free");
    } else {
        println!("Mutexes      : {}", held.join(" "));
    }
    Ok(())
}
