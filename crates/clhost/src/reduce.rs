//! Multi-pass tree reduction.
//!
//! The map kernel runs once over the whole input and leaves one partial
//! result per work-group. The reduction kernel then runs over the partials,
//! again leaving one per group, until a single group remains. Both kernels
//! must already have their arguments bound and read the element count of a
//! pass from their global size.

use crate::error::{ClError, Result};
use crate::resource::{CommandQueue, Event, Kernel};
use crate::work::{group_count, WorkSize};

/// Reduces `n` elements with work-groups of `local_n` items.
///
/// On an out-of-order queue each pass waits for the previous one through an
/// event; an in-order queue orders them already. Returns once every pass is
/// enqueued.
///
/// # Errors
///
/// [`ClError::InvalidArgument`] if `n` or `local_n` is zero, or if
/// `local_n == 1` with `n > 1` (a pass would never shrink the input).
/// Otherwise the native status of a failed launch.
pub fn reduce<'q>(
    queue: &'q CommandQueue,
    main: &Kernel,
    reduction: &Kernel,
    n: usize,
    local_n: usize,
) -> Result<&'q CommandQueue> {
    check_converges(n, local_n)?;
    passes(queue, main, reduction, n, local_n, |extent| {
        WorkSize::linear(extent, local_n)
    })
}

/// Reduces along the second extent of an `m` x `n` grid, holding `m` fixed.
///
/// # Errors
///
/// As [`reduce`], and additionally if `m` or `local_m` is zero.
pub fn reduce_2d<'q>(
    queue: &'q CommandQueue,
    main: &Kernel,
    reduction: &Kernel,
    m: usize,
    n: usize,
    local_m: usize,
    local_n: usize,
) -> Result<&'q CommandQueue> {
    if m == 0 || local_m == 0 {
        return Err(ClError::invalid(format!(
            "fixed extent {m} with local size {local_m} must be non-zero"
        )));
    }
    check_converges(n, local_n)?;
    passes(queue, main, reduction, n, local_n, |extent| {
        WorkSize::planar([m, extent], [local_m, local_n])
    })
}

fn check_converges(n: usize, local_n: usize) -> Result<()> {
    if n == 0 {
        return Err(ClError::invalid("cannot reduce zero elements"));
    }
    if local_n == 0 {
        return Err(ClError::invalid("reduction local size must be non-zero"));
    }
    if local_n > 1 || n <= local_n {
        Ok(())
    } else {
        Err(ClError::invalid(format!(
            "local size {local_n} never reduces {n} elements to one group"
        )))
    }
}

fn passes<'q>(
    queue: &'q CommandQueue,
    main: &Kernel,
    reduction: &Kernel,
    n: usize,
    local_n: usize,
    shape: impl Fn(usize) -> WorkSize,
) -> Result<&'q CommandQueue> {
    let chain = queue.properties().is_out_of_order();
    let mut previous: Option<Event> = None;
    let mut kernel = main;
    let mut extent = n;
    let mut launches = 0usize;
    loop {
        let mut done = None;
        let launched = queue.launch(
            kernel,
            &shape(extent),
            previous.as_slice(),
            chain.then_some(&mut done),
        );
        let released = previous.take().map_or(Ok(()), |event| event.release());
        previous = done;
        let failures: Vec<ClError> = launched.err().into_iter().chain(released.err()).collect();
        if !failures.is_empty() {
            return Err(abandon(previous, failures));
        }
        launches += 1;

        let groups = group_count(local_n, extent);
        if groups == 1 {
            break;
        }
        kernel = reduction;
        extent = groups;
    }
    if let Some(last) = previous {
        last.release()?;
    }
    tracing::debug!(queue = queue.id().0, n, local_n, launches, "reduction enqueued");
    Ok(queue)
}

/// Releases the event of the last launch, if any, and folds every failure
/// into one error.
fn abandon(pending: Option<Event>, mut failures: Vec<ClError>) -> ClError {
    if let Some(Err(err)) = pending.map(|event| event.release()) {
        failures.push(err);
    }
    if failures.len() == 1 {
        failures.remove(0)
    } else {
        ClError::Aggregate(failures)
    }
}

#[cfg(all(test, feature = "mock"))]
#[allow(clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::driver::Driver;
    use crate::flags::{DeviceType, MemFlags, QueueProperties};
    use crate::resource::{Buffer, Context, Platform, Program};
    use crate::status::{NativeResult, Status};
    use std::sync::Arc;

    const SOURCE: &str = "\
        __kernel void square_sum(__global float* data) {}\n\
        __kernel void sum(__global float* data) {}\n";

    /// Sums each `local`-sized group of the first `global` values of
    /// argument 0 into the front of the same buffer.
    fn group_sums(work: &WorkSize, mem: &mut crate::backend::mock::KernelMemory, square: bool) -> NativeResult<()> {
        let [global, local] = match work.dims() {
            1 => [work.global()[0], work.local()[0]],
            _ => [work.global()[1], work.local()[1]],
        };
        let values: Vec<f32> = mem.read(0)?;
        let partials: Vec<f32> = values[..global]
            .chunks(local)
            .map(|group| group.iter().map(|v| if square { v * v } else { *v }).sum())
            .collect();
        mem.write(0, 0, &partials)
    }

    struct Fixture {
        mock: Arc<MockDriver>,
        _ctx: Context,
        queue: CommandQueue,
        main: crate::resource::Kernel,
        sum: crate::resource::Kernel,
        data: Buffer,
    }

    fn fixture(properties: QueueProperties, len: usize) -> Fixture {
        let mock = Arc::new(MockDriver::new());
        mock.register_kernel("square_sum", |work, mem| group_sums(work, mem, true));
        mock.register_kernel("sum", |work, mem| group_sums(work, mem, false));
        let driver: Arc<dyn Driver> = mock.clone();
        let devices = Platform::list(&driver).unwrap()[0]
            .devices(DeviceType::Cpu)
            .unwrap();
        let ctx = Context::new(&devices).unwrap();
        let queue = CommandQueue::new(&ctx, &devices[0], properties).unwrap();
        let program = Program::with_source(&ctx, &[SOURCE]).unwrap();
        program.build(&[], "").unwrap();
        let values: Vec<f32> = (1..=len).map(|i| i as f32).collect();
        let data = Buffer::from_slice(&ctx, MemFlags::READ_WRITE, &values).unwrap();
        let main = program.kernel("square_sum").unwrap();
        let sum = program.kernel("sum").unwrap();
        main.set_arg(0, &data.arg()).unwrap();
        sum.set_arg(0, &data.arg()).unwrap();
        Fixture { mock, _ctx: ctx, queue, main, sum, data }
    }

    fn sum_of_squares(n: usize) -> f32 {
        (1..=n).map(|i| (i * i) as f32).sum()
    }

    #[test]
    fn thousand_elements_take_two_launches() {
        let f = fixture(QueueProperties::IN_ORDER, 1000);
        reduce(&f.queue, &f.main, &f.sum, 1000, 256).unwrap();
        let launches = f.mock.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].kernel, "square_sum");
        assert_eq!(launches[0].work, WorkSize::linear(1000, 256));
        assert_eq!(launches[1].kernel, "sum");
        assert_eq!(launches[1].work, WorkSize::linear(4, 256));
    }

    #[test]
    fn single_group_needs_only_the_map_pass() {
        let f = fixture(QueueProperties::IN_ORDER, 256);
        reduce(&f.queue, &f.main, &f.sum, 256, 256).unwrap();
        assert_eq!(f.mock.launches().len(), 1);
    }

    #[test]
    fn pass_count_is_logarithmic() {
        let f = fixture(QueueProperties::IN_ORDER, 5000);
        reduce(&f.queue, &f.main, &f.sum, 5000, 4).unwrap();
        // 5000 -> 1250 -> 313 -> 79 -> 20 -> 5 -> 2 -> 1
        assert_eq!(f.mock.launches().len(), 7);
    }

    #[test]
    fn result_lands_in_first_element() {
        let f = fixture(QueueProperties::IN_ORDER, 1000);
        reduce(&f.queue, &f.main, &f.sum, 1000, 16).unwrap().finish().unwrap();
        let out: Vec<f32> = f.queue.read_into(&f.data, &[]).unwrap();
        assert!((out[0] - sum_of_squares(1000)).abs() / sum_of_squares(1000) < 1e-5);
    }

    #[test]
    fn out_of_order_passes_are_chained() {
        let f = fixture(QueueProperties::OUT_OF_ORDER, 1000);
        let before = f.mock.live_objects();
        reduce(&f.queue, &f.main, &f.sum, 1000, 16).unwrap();
        let mut done = None;
        f.queue.marker(&[], Some(&mut done)).unwrap();
        done.unwrap().wait().unwrap();
        let out: Vec<f32> = f.queue.read_into(&f.data, &[]).unwrap();
        assert!((out[0] - sum_of_squares(1000)).abs() / sum_of_squares(1000) < 1e-5);
        // Intermediate pass events were released; only the marker remains.
        assert_eq!(f.mock.live_objects(), before + 1);
    }

    #[test]
    fn failed_event_release_does_not_leak_the_next_pass() {
        let f = fixture(QueueProperties::OUT_OF_ORDER, 1000);
        let mut mark = None;
        f.queue.marker(&[], Some(&mut mark)).unwrap();
        let mark = mark.unwrap();
        mark.release().unwrap();
        // Ids are sequential, so the first pass gets the next one.
        f.mock.fail_release(mark.id().0 + 1, Status::OUT_OF_RESOURCES);
        let live = f.mock.live_objects();

        let err = reduce(&f.queue, &f.main, &f.sum, 1000, 16).unwrap_err();
        assert_eq!(err.status(), Some(Status::OUT_OF_RESOURCES));
        assert_eq!(f.mock.launches().len(), 2);
        // Only the event whose release failed still holds a reference.
        assert_eq!(f.mock.live_objects(), live + 1);
    }

    #[test]
    fn unit_local_size_fails_fast() {
        let f = fixture(QueueProperties::IN_ORDER, 4);
        let err = reduce_2d(&f.queue, &f.main, &f.sum, 2, 4, 1, 1).unwrap_err();
        assert!(matches!(err, ClError::InvalidArgument(_)));
        assert!(matches!(
            reduce(&f.queue, &f.main, &f.sum, 4, 1),
            Err(ClError::InvalidArgument(_))
        ));
        assert!(f.mock.launches().is_empty());
    }

    #[test]
    fn unit_local_size_over_one_element_is_fine() {
        let f = fixture(QueueProperties::IN_ORDER, 1);
        reduce(&f.queue, &f.main, &f.sum, 1, 1).unwrap();
        assert_eq!(f.mock.launches().len(), 1);
    }

    #[test]
    fn zero_extents_are_rejected() {
        let f = fixture(QueueProperties::IN_ORDER, 4);
        assert!(reduce(&f.queue, &f.main, &f.sum, 0, 256).is_err());
        assert!(reduce(&f.queue, &f.main, &f.sum, 4, 0).is_err());
        assert!(reduce_2d(&f.queue, &f.main, &f.sum, 0, 4, 1, 2).is_err());
        assert!(f.mock.launches().is_empty());
    }

    #[test]
    fn two_dimensional_reduction_keeps_rows_fixed() {
        let f = fixture(QueueProperties::IN_ORDER, 1000);
        reduce_2d(&f.queue, &f.main, &f.sum, 3, 1000, 1, 256).unwrap();
        let shapes: Vec<WorkSize> = f.mock.launches().into_iter().map(|l| l.work).collect();
        assert_eq!(
            shapes,
            vec![WorkSize::planar([3, 1000], [1, 256]), WorkSize::planar([3, 4], [1, 256])]
        );
    }
}
