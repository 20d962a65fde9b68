#![cfg(feature = "mock")]

use clhost::backend::mock::{KernelMemory, MockDriver};
use clhost::status::NativeResult;
use clhost::{
    build_notify, channel, follow, reduce, release_all, Buffer, CallbackMessage, Driver, Event,
    ExecutionStatus, MemFlags, Program, QueueProperties, Session, SessionConfig, WorkSize,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const SOURCE: &str = "\
    __kernel void square_sum(__global int* data) {}\n\
    __kernel void sum(__global int* data) {}\n";

fn group_sums(work: &WorkSize, mem: &mut KernelMemory, square: bool) -> NativeResult<()> {
    let (global, local) = (work.global()[0], work.local()[0]);
    let values: Vec<i64> = mem.read(0)?;
    let partials: Vec<i64> = values[..global]
        .chunks(local)
        .map(|group| group.iter().map(|v| if square { v * v } else { *v }).sum())
        .collect();
    mem.write(0, 0, &partials)
}

fn session(properties: QueueProperties) -> (Arc<MockDriver>, Session) {
    let mock = Arc::new(MockDriver::new());
    mock.register_kernel("square_sum", |work, mem| group_sums(work, mem, true));
    mock.register_kernel("sum", |work, mem| group_sums(work, mem, false));
    let driver: Arc<dyn Driver> = mock.clone();
    let config = SessionConfig {
        queue: properties,
        ..SessionConfig::default()
    };
    (mock, Session::open(&driver, &config).unwrap())
}

#[tokio::test]
async fn reduction_completion_arrives_on_async_channel() {
    let (_mock, session) = session(QueueProperties::OUT_OF_ORDER);
    let ctx = session.context();
    let queue = session.queue();
    let input: Vec<i64> = (1..=10_000).collect();
    let data = Buffer::from_slice(ctx, MemFlags::READ_WRITE, &input).unwrap();
    let program = Program::with_source(ctx, &[SOURCE]).unwrap();
    program.build(&[], "").unwrap();
    let main = program.kernel("square_sum").unwrap();
    let sum = program.kernel("sum").unwrap();
    main.set_arg(0, &data.arg()).unwrap();
    sum.set_arg(0, &data.arg()).unwrap();

    let (tx, mut rx) = channel();
    let mut done = None;
    reduce(queue, &main, &sum, input.len(), 64)
        .unwrap()
        .marker(&[], Some(&mut done))
        .unwrap();
    let done = done.unwrap();
    follow(tx).event(&done, "reduced").unwrap();

    let message: CallbackMessage<&str> = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.event, done.id());
    assert_eq!(message.status, ExecutionStatus::Complete);
    assert_eq!(message.data, "reduced");

    let out: Vec<i64> = queue.read_into(&data, &[]).unwrap();
    assert_eq!(out[0], input.iter().map(|v| v * v).sum::<i64>());

    release_all(vec![
        clhost::Resource::from(done),
        main.into(),
        sum.into(),
        program.into(),
        data.into(),
    ])
    .unwrap();
    session.release().unwrap();
}

#[tokio::test]
async fn each_followed_event_reports_once() {
    let (_mock, session) = session(QueueProperties::IN_ORDER);
    let gates: Vec<Event> = (0..3).map(|_| Event::user(session.context()).unwrap()).collect();
    let (tx, mut rx) = channel();
    let follower = follow(tx);
    for (i, gate) in gates.iter().enumerate() {
        follower.event(gate, i).unwrap();
    }
    drop(follower);

    gates[2].set_status(ExecutionStatus::Complete).unwrap();
    let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.data, 2);

    gates[0].set_status(ExecutionStatus::Error(-5)).unwrap();
    gates[1].set_status(ExecutionStatus::Complete).unwrap();
    let mut rest = Vec::new();
    while let Some(message) = timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
        rest.push((message.data, message.status));
    }
    rest.sort_by_key(|(i, _)| *i);
    assert_eq!(
        rest,
        vec![(0, ExecutionStatus::Error(-5)), (1, ExecutionStatus::Complete)]
    );
    release_all(gates).unwrap();
    session.release().unwrap();
}

#[tokio::test]
async fn build_completion_is_delivered_asynchronously() {
    let (_mock, session) = session(QueueProperties::IN_ORDER);
    let program = Program::with_source(session.context(), &[SOURCE]).unwrap();
    let (tx, mut rx) = channel();
    build_notify(&program, &[], "-D N=4", tx, 42u32).unwrap();
    let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!((message.program, message.data), (program.id(), 42));
    let kernel = program.kernel("sum").unwrap();
    release_all(vec![clhost::Resource::from(kernel), program.into()]).unwrap();
    session.release().unwrap();
}
