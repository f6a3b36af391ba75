// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gpuvm_common::{MemoryDomain, PAGE_SIZE_U64, SZ_2M};
use gpuvm_core::{AsyncOp, BindRequest, ComputeContext, Device, Vm, VmMode};
use gpuvm_hw::{BufferBackend, Fence, HostProt};

/// gpuvm - GPU virtual address space simulator
#[derive(Parser, Debug)]
#[command(name = "gpuvm", version, about = "Simulated GPU virtual memory manager")]
struct Args {
    /// Path to config file (default: ~/.config/gpuvm/gpuvm.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Workload to run
    #[arg(short, long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Bind, partially unbind and prefetch buffer mappings
    Buffers,
    /// Map host memory and survive a page migration
    Userptr,
    /// Queue binds asynchronously
    Async,
    /// Rebind under preemption of compute contexts
    Preempt,
    All,
}

const WAIT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("gpuvm - GPU virtual address space simulator");

    let settings = config::load_config(args.config.as_ref());
    info!(
        "VRAM {} MiB, system {} MiB, {} tile(s), page tables in {}",
        settings.vram_size >> 20,
        settings.system_size >> 20,
        settings.tile_count,
        settings.pt_domain
    );

    let dev = Device::attach(settings).context("Failed to attach device")?;

    let run = |s: Scenario| args.scenario == Scenario::All || args.scenario == s;
    if run(Scenario::Buffers) {
        run_buffers(&dev).context("buffers scenario failed")?;
    }
    if run(Scenario::Userptr) {
        run_userptr(&dev).context("userptr scenario failed")?;
    }
    if run(Scenario::Async) {
        run_async(&dev).context("async scenario failed")?;
    }
    if run(Scenario::Preempt) {
        run_preempt(&dev).context("preempt scenario failed")?;
    }

    for tile in 0..dev.tile_count() {
        if let Some(m) = dev.migrate(tile) {
            let s = m.stats();
            info!(
                "tile {}: {} large + {} small passes, {} CPU / {} GPU page-table updates in {} batches",
                tile, s.large_passes, s.small_passes, s.cpu_updates, s.gpu_updates, s.batches
            );
        }
    }
    info!("Simulation finished");
    Ok(())
}

fn wait(fence: &Arc<Fence>, what: &str) -> Result<()> {
    fence.wait(WAIT).with_context(|| format!("waiting for {}", what))
}

fn close(vm: &Vm) -> Result<()> {
    let fence = vm.close()?;
    wait(&fence, "close")
}

fn run_buffers(dev: &Arc<Device>) -> Result<()> {
    let vm = dev.create_vm(VmMode::Default)?;
    let buffer = dev.backend().create(4 * SZ_2M, MemoryDomain::System)?;
    let idle = buffer.lock().idle_fence();
    wait(&idle, "buffer clear")?;

    let va = 0x1_0000_0000;
    let fence = vm.bind(BindRequest::buffer(va, 4 * SZ_2M, buffer.clone(), 0))?;
    wait(&fence, "bind")?;
    info!("bound 8 MiB at 0x{:X}, {} page-table nodes", va, vm.pt_node_count());

    let fence = vm.unbind(va + SZ_2M, 16 * PAGE_SIZE_U64, Vec::new())?;
    wait(&fence, "partial unbind")?;
    for m in vm.mappings() {
        info!("  [0x{:X}..0x{:X}) {:?}", m.start, m.end, m.state);
    }

    let fence = vm.prefetch(va, 4 * SZ_2M, MemoryDomain::Vram)?;
    wait(&fence, "prefetch")?;
    let t = vm
        .translate(0, va)?
        .context("mapping lost its translation after prefetch")?;
    info!("prefetched to {}, first leaf {} KiB", t.domain, t.page_size >> 10);

    close(&vm)?;
    info!("buffers: {} page-table node(s) left", vm.pt_node_count());
    Ok(())
}

fn run_userptr(dev: &Arc<Device>) -> Result<()> {
    let vm = dev.create_vm(VmMode::Default)?;
    let host = dev.new_host_mm();
    let hva = host.mmap(SZ_2M, HostProt::READ_WRITE)?;
    host.write(hva, b"userptr")?;

    let va = 0x8000_0000;
    let fence = vm.bind(BindRequest::userptr(va, SZ_2M, host.clone(), hva))?;
    wait(&fence, "userptr bind")?;

    let frame = host.migrate_page(hva)?;
    info!("host page moved to 0x{:X}, mapping invalidated", frame);
    let fence = vm.prepare_exec()?;
    wait(&fence, "revalidation")?;

    let mut data = [0u8; 7];
    vm.read_gpu(va, &mut data)?;
    anyhow::ensure!(&data == b"userptr", "device read back {:?}", data);
    info!("userptr: revalidated mapping reads host data");
    close(&vm)
}

fn run_async(dev: &Arc<Device>) -> Result<()> {
    let vm = dev.create_vm(VmMode::Default)?;
    let buffer = dev.backend().create(SZ_2M, MemoryDomain::Vram)?;
    let idle = buffer.lock().idle_fence();
    wait(&idle, "buffer clear")?;

    let mut fences = Vec::new();
    for i in 0..16u64 {
        let req = BindRequest::buffer(0x2_0000_0000 + i * SZ_2M, SZ_2M, buffer.clone(), 0).asynchronous();
        fences.push(vm.bind(req)?);
    }
    fences.push(vm.submit_async(
        AsyncOp::Unbind {
            start: 0x2_0000_0000,
            len: 8 * SZ_2M,
            syncs: Vec::new(),
        },
        None,
    )?);
    wait(&Fence::all(fences), "async queue")?;
    info!("async: {} mapping(s) after queued binds", vm.mappings().len());
    close(&vm)
}

fn run_preempt(dev: &Arc<Device>) -> Result<()> {
    let vm = dev.create_vm(VmMode::Preempt)?;
    let ctx = ComputeContext::new("compute0");
    vm.register_context(ctx.clone())?;

    let buffer = dev.backend().create(SZ_2M, MemoryDomain::Vram)?;
    let idle = buffer.lock().idle_fence();
    wait(&idle, "buffer clear")?;
    let fence = vm.bind(BindRequest::buffer(0x3_0000_0000, SZ_2M, buffer.clone(), 0))?;
    wait(&fence, "bind")?;

    if let Some(moved) = dev.backend().evict(&buffer, MemoryDomain::System)? {
        wait(&moved, "eviction")?;
    }
    let fence = vm.preempt_rebind()?;
    wait(&fence, "preempt rebind")?;
    info!(
        "preempt: '{}' preempted {} time(s), running again",
        ctx.name(),
        ctx.preemptions()
    );
    close(&vm)
}
