#![deny(clippy::all, clippy::pedantic)]
//! Sums the squares of `1..=n` on a compute device through a multi-pass
//! reduction and prints the result.
//!
//! The kernels run on the in-process mock driver, which executes them as the
//! host closures registered in [`register_kernels`].

use anyhow::{Context as _, Result};
use clap::Parser;
use clhost::backend::mock::{KernelMemory, MockDriver};
use clhost::status::NativeResult;
use clhost::{
    follow, reduce, with_release, Buffer, DeviceType, Driver, ExecutionStatus, KernelArg,
    MemFlags, Program, QueueProperties, Session, SessionConfig, WorkSize,
};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const SOURCE: &str = "\
// Entry points only; the driver runs host implementations.
__kernel void square_sum(__global ulong* data, __local ulong* scratch) {}
__kernel void sum(__global ulong* data, __local ulong* scratch) {}
";

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "clhost_runtime", about = "Reduce 1..=n squared on a compute device")]
struct Args {
    /// Number of elements to reduce.
    #[arg(long, default_value_t = 100_000)]
    n: usize,

    /// Work-group size. Defaults to the device maximum, capped at 256.
    #[arg(long)]
    local: Option<usize>,

    /// Device category: default, cpu, gpu, accelerator, custom or all.
    #[arg(long, default_value = "all")]
    device_type: DeviceType,

    #[arg(long)]
    out_of_order: bool,

    #[arg(long)]
    profiling: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut queue = QueueProperties::IN_ORDER;
        if self.out_of_order {
            queue |= QueueProperties::OUT_OF_ORDER;
        }
        if self.profiling {
            queue |= QueueProperties::PROFILING;
        }
        SessionConfig {
            device_type: self.device_type,
            queue,
            ..SessionConfig::default()
        }
    }
}

/// Sums each work-group's slice of the first global-size elements into the
/// front of argument 0.
fn group_sums(work: &WorkSize, mem: &mut KernelMemory, square: bool) -> NativeResult<()> {
    let (global, local) = (work.global()[0], work.local()[0]);
    let values: Vec<u64> = mem.read(0)?;
    let partials: Vec<u64> = values[..global]
        .chunks(local)
        .map(|group| {
            group.iter().fold(0u64, |acc, v| {
                acc.wrapping_add(if square { v.wrapping_mul(*v) } else { *v })
            })
        })
        .collect();
    mem.write(0, 0, &partials)
}

fn register_kernels(mock: &MockDriver) {
    mock.register_kernel("square_sum", |work, mem| group_sums(work, mem, true));
    mock.register_kernel("sum", |work, mem| group_sums(work, mem, false));
}

fn run(session: &Session, args: &Args) -> Result<u64> {
    let info = session.device_info()?;
    let local = args.local.unwrap_or_else(|| info.max_work_group_size.min(256));
    tracing::info!(device = %info.name, n = args.n, local, "starting reduction");

    let input: Vec<u64> = (1..=args.n as u64).collect();
    let (tx, rx) = mpsc::channel();

    let total = with_release(|scope| {
        let ctx = session.context();
        let queue = session.queue();
        let data = scope.adopt(Buffer::from_slice(ctx, MemFlags::READ_WRITE, &input)?);
        let program = scope.adopt(Program::with_source(ctx, &[SOURCE])?);
        program.build(&[], "")?;
        let scratch = KernelArg::Local(local * std::mem::size_of::<u64>());
        let main = scope.adopt(program.kernel("square_sum")?);
        main.set_args(&[data.arg(), scratch.clone()])?;
        let sum = scope.adopt(program.kernel("sum")?);
        sum.set_args(&[data.arg(), scratch])?;

        let mut done = None;
        reduce(queue, &main, &sum, args.n, local)?.marker(&[], Some(&mut done))?;
        scope.push(done.clone());
        if let Some(done) = &done {
            follow(tx).event(done, args.n)?;
        }
        queue.flush()?;

        let mut total = [0u64];
        queue.read(&data, 0, &mut total[..], done.as_slice(), None)?;
        Ok(total[0])
    })?;

    let message = rx
        .recv_timeout(COMPLETION_TIMEOUT)
        .context("reduction completion was not reported")?;
    anyhow::ensure!(
        message.status == ExecutionStatus::Complete,
        "reduction ended with {}",
        message.status
    );
    tracing::info!(event = message.event.0, elements = message.data, "reduction complete");
    Ok(total)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mock = Arc::new(MockDriver::new());
    register_kernels(&mock);
    let driver: Arc<dyn Driver> = mock;

    let session = Session::open(&driver, &args.session_config())?;
    let outcome = run(&session, &args);
    let released = session.release();
    let total = outcome?;
    released?;

    println!("sum of squares of 1..={}: {total}", args.n);
    Ok(())
}
