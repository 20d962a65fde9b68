#![cfg(feature = "mock")]

use clhost::backend::mock::MockDriver;
use clhost::{
    release_all, with_release, Buffer, ClError, Driver, Event, KernelArg,
    MemFlags, Program, QueueProperties, Session, SessionConfig, Status, WorkSize,
};
use std::error::Error as _;
use std::sync::Arc;

const SCALE: &str = "__kernel void scale(__global float* data, float factor) {}";

fn open(properties: QueueProperties) -> (Arc<MockDriver>, Session) {
    let mock = Arc::new(MockDriver::new());
    mock.register_kernel("scale", |work, mem| {
        let factor: f32 = mem.scalar(1)?;
        let scaled: Vec<f32> = mem
            .read::<f32>(0)?
            .into_iter()
            .take(work.items())
            .map(|v| v * factor)
            .collect();
        mem.write(0, 0, &scaled)
    });
    let driver: Arc<dyn Driver> = mock.clone();
    let config = SessionConfig {
        queue: properties,
        ..SessionConfig::default()
    };
    let session = Session::open(&driver, &config).unwrap();
    (mock, session)
}

#[test]
fn scoped_pipeline_releases_everything() {
    let (mock, session) = open(QueueProperties::IN_ORDER);
    let baseline = mock.live_objects();

    let out = with_release(|scope| {
        let ctx = session.context();
        let queue = session.queue();
        let data = scope.adopt(Buffer::from_slice(ctx, MemFlags::READ_WRITE, &[1.0f32, 2.0, 3.0, 4.0])?);
        let program = scope.adopt(Program::with_source(ctx, &[SCALE])?);
        program.build(&[], "-D WIDTH=4")?;
        let kernel = scope.adopt(program.kernel("scale")?);
        kernel.set_args(&[data.arg(), KernelArg::scalar(3.0f32)])?;
        let mut done = None;
        queue.launch(&kernel, &WorkSize::linear(4, 4), &[], Some(&mut done))?;
        scope.push(done.clone());
        queue.read_into::<f32>(&data, done.as_slice())
    })
    .unwrap();

    assert_eq!(out, vec![3.0, 6.0, 9.0, 12.0]);
    assert_eq!(mock.live_objects(), baseline);
    session.release().unwrap();
    assert_eq!(mock.live_objects(), 0);
}

#[test]
fn failed_body_keeps_its_error_when_releases_succeed() {
    let (mock, session) = open(QueueProperties::IN_ORDER);
    let err = with_release(|scope| {
        let program = scope.adopt(Program::with_source(session.context(), &[SCALE])?);
        program.kernel("scale")?;
        Ok(())
    })
    .unwrap_err();
    // Creating a kernel from an unbuilt program is refused by the driver.
    assert_eq!(err.status(), Some(Status::INVALID_PROGRAM_EXECUTABLE));
    assert!(!matches!(err, ClError::Unwind { .. }));
    session.release().unwrap();
    assert_eq!(mock.live_objects(), 0);
}

#[test]
fn release_failure_during_unwind_keeps_original_as_source() {
    let (mock, session) = open(QueueProperties::IN_ORDER);
    let err = with_release(|scope| {
        let buf = scope.adopt(Buffer::new(session.context(), MemFlags::READ_WRITE, 16)?);
        mock.fail_release(buf.id().0, Status::OUT_OF_RESOURCES);
        Err::<(), _>(ClError::InvalidArgument("body failed".into()))
    })
    .unwrap_err();

    let ClError::Unwind { original, release } = &err else {
        panic!("expected an unwind error, got {err}");
    };
    assert!(matches!(**original, ClError::InvalidArgument(_)));
    assert_eq!(release.len(), 1);
    assert_eq!(release[0].status(), Some(Status::OUT_OF_RESOURCES));
    assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("invalid argument: body failed"));
    session.release().unwrap();
}

#[test]
fn nested_collections_release_each_leaf_once() {
    let (mock, session) = open(QueueProperties::IN_ORDER);
    let ctx = session.context();
    let a = Buffer::new(ctx, MemFlags::READ_WRITE, 8).unwrap();
    let b = Buffer::new(ctx, MemFlags::READ_ONLY, 8).unwrap();
    let c = Buffer::new(ctx, MemFlags::WRITE_ONLY, 8).unwrap();
    let user = Event::user(ctx).unwrap();
    let before = mock.release_log().len();

    let visited = release_all(vec![vec![a.clone(), b.clone()], vec![c.clone()]]).unwrap();
    assert_eq!(visited, 3);
    assert_eq!(release_all(Some(user)).unwrap(), 1);
    assert_eq!(release_all(None::<Buffer>).unwrap(), 0);

    let ids: Vec<usize> = mock.release_log()[before..].iter().map(|(_, id)| *id).collect();
    assert_eq!(ids.len(), 4);
    assert_eq!(&ids[..3], &[a.id().0, b.id().0, c.id().0]);
    session.release().unwrap();
}

#[test]
fn retained_buffer_outlives_its_scope() {
    let (mock, session) = open(QueueProperties::IN_ORDER);
    let queue = session.queue();
    let kept = with_release(|scope| {
        let buf = scope.adopt(Buffer::from_slice(session.context(), MemFlags::READ_WRITE, &[7u32; 4])?);
        buf.retain()?;
        Ok(buf)
    })
    .unwrap();
    assert_eq!(queue.read_into::<u32>(&kept, &[]).unwrap(), vec![7; 4]);
    kept.release().unwrap();
    assert!(kept.release().is_err());
    session.release().unwrap();
    assert_eq!(mock.live_objects(), 0);
}

#[test]
fn build_failure_reports_every_device_log() {
    let mock = Arc::new(MockDriver::new());
    let driver: Arc<dyn Driver> = mock.clone();
    let devices = clhost::Platform::list(&driver).unwrap()[0]
        .devices(clhost::DeviceType::All)
        .unwrap();
    let ctx = clhost::Context::new(&devices).unwrap();
    let program = Program::with_source(&ctx, &["#error missing include\n", SCALE]).unwrap();
    let err = program.build(&[], "").unwrap_err();
    let ClError::Build { code, logs, .. } = &err else {
        panic!("expected a build error, got {err}");
    };
    assert_eq!(*code, Status::BUILD_PROGRAM_FAILURE.code());
    assert_eq!(logs.len(), devices.len());
    assert!(logs.iter().all(|(_, log)| log.contains("missing include")));
    release_all(vec![clhost::Resource::from(program), ctx.into()]).unwrap();
}
