#![cfg(feature = "mock")]

mod common;

use common::{classifier, device_with_ordinal, loader, CLASSIFIER, INPUT_ELEMENTS};
use std::thread;
use trtbind::{
    classify, cuda, execute, execute_zeroed, DataType, EngineLoader, Error, ErrorClass,
    HostTensor, LoaderConfig, Session, SessionState, Stream, TensorInput,
};

fn ones() -> HostTensor {
    HostTensor::from_f32(vec![1, 3, 224, 224], &vec![1.0; INPUT_ELEMENTS]).unwrap()
}

#[test]
fn shape_mismatch_is_rejected_before_device_work() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();

    let wrong = HostTensor::zeros(DataType::Float32, vec![1, 3, 224, 225]);
    let err = session.bind("input", wrong).unwrap_err();

    assert_eq!(err.class(), ErrorClass::Usage);
    assert_eq!(
        err.to_string(),
        "Shape mismatch for binding `input`: expected float32[1,3,224,224], got float32[1,3,224,225]"
    );
    assert_eq!(session.state(), SessionState::Created);
    assert!(!session.is_bound("input").unwrap());
}

#[test]
fn dtype_mismatch_is_a_shape_mismatch() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();

    let wrong = HostTensor::zeros(DataType::Float16, vec![1, 3, 224, 224]);
    assert!(matches!(
        session.bind("input", wrong),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn unknown_binding() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();

    let err = session.bind("image", ones()).unwrap_err();
    assert!(matches!(err, Error::UnknownBinding(ref name) if name == "image"));
}

#[test]
fn run_requires_every_input() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();

    match session.run().unwrap_err() {
        Error::IncompleteBinding { missing } => assert_eq!(missing, vec!["input"]),
        other => panic!("expected incomplete binding, got {:?}", other),
    }
}

#[test]
fn run_fills_outputs() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();
    session.run().unwrap();

    let output = session.output("output").unwrap();
    assert_eq!(output.shape(), &[1, 1000]);
    let values = output.to_f32_vec().unwrap();
    assert_eq!(values[0], INPUT_ELEMENTS as f32);
    assert_eq!(values[999], (INPUT_ELEMENTS + 999) as f32);

    // Rebinding and running again reuses the same buffers
    session
        .bind("input", HostTensor::zeros(DataType::Float32, vec![1, 3, 224, 224]))
        .unwrap();
    session.run().unwrap();
    assert_eq!(session.output("output").unwrap().to_f32_vec().unwrap()[5], 5.0);
}

#[test]
fn repeated_runs_are_bit_identical() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    let mut values = vec![0.0; INPUT_ELEMENTS];
    values[7] = 0.1;
    values[42] = -3.25;
    session
        .bind("input", HostTensor::from_f32(vec![1, 3, 224, 224], &values).unwrap())
        .unwrap();

    session.run().unwrap();
    let first = session.output("output").unwrap().as_bytes().to_vec();
    session.run().unwrap();
    let second = session.output("output").unwrap().as_bytes();

    assert_eq!(first, second);
}

#[test]
fn bound_output_receives_results() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();
    session
        .bind("output", HostTensor::zeros(DataType::Float32, vec![1, 1000]))
        .unwrap();
    session.run().unwrap();

    let output = session.take_output("output").unwrap();
    assert_eq!(output.to_f32_vec().unwrap()[1], (INPUT_ELEMENTS + 1) as f32);
}

#[test]
fn destroyed_session_rejects_everything() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();
    session.destroy().unwrap();
    assert_eq!(session.state(), SessionState::Destroyed);

    let err = session.run().unwrap_err();
    assert!(matches!(err, Error::UseAfterFree("run")));
    assert_eq!(err.class(), ErrorClass::Lifecycle);
    assert!(matches!(
        session.bind("input", ones()),
        Err(Error::UseAfterFree(_))
    ));
    assert!(matches!(session.output("output"), Err(Error::UseAfterFree(_))));
    assert!(matches!(session.read_profile(), Err(Error::UseAfterFree(_))));
    assert!(matches!(
        session.destroy(),
        Err(Error::UseAfterFree("destroy"))
    ));
}

#[test]
fn allocation_failure_is_out_of_memory() {
    let engine = loader()
        .build_from_onnx(
            b"trtbind-mock-network v1\ninput small float32 4\ninput large float32 1000000\noutput y float32 1\n",
        )
        .unwrap();

    trtbind_sys::trtb_mock_set_allocation_limit(1024);
    let err = Session::new(&engine).unwrap_err();
    trtbind_sys::trtb_mock_set_allocation_limit(0);

    assert!(matches!(err, Error::OutOfMemory(_)), "got {:?}", err);
    assert_eq!(err.class(), ErrorClass::ResourceExhausted);
    assert!(Session::new(&engine).is_ok());
}

#[test]
fn sessions_keep_the_engine_alive() {
    let engine = classifier();
    let mut session = engine.create_session().unwrap();
    assert_eq!(engine.handle_count(), 2);

    drop(engine);
    session.bind("input", ones()).unwrap();
    session.run().unwrap();
    assert_eq!(session.engine().bindings().len(), 2);
}

#[test]
fn sessions_run_concurrently_on_one_engine() {
    let engine = classifier();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut session = Session::new(&engine).unwrap();
                let mut values = vec![0.0; INPUT_ELEMENTS];
                values[0] = i as f32;
                session
                    .bind("input", HostTensor::from_f32(vec![1, 3, 224, 224], &values).unwrap())
                    .unwrap();
                session.run().unwrap();
                session.output("output").unwrap().to_f32_vec().unwrap()[0]
            })
        })
        .collect();

    let results: Vec<f32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn sessions_follow_the_engine_device_across_threads() {
    let device = device_with_ordinal(1);
    let loader = EngineLoader::new(&device, LoaderConfig::default()).unwrap();
    let engine = loader.build_from_onnx(CLASSIFIER).unwrap();
    assert_eq!(engine.device().ordinal(), 1);

    // Fresh threads start on device 0
    let worker = {
        let engine = engine.clone();
        thread::spawn(move || {
            let mut session = Session::new(&engine).unwrap();
            session.bind("input", ones()).unwrap();
            session.run().unwrap();
            session.output("output").unwrap().to_f32_vec().unwrap()[1]
        })
    };
    assert_eq!(worker.join().unwrap(), (INPUT_ELEMENTS + 1) as f32);

    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();
    cuda::set_device(0).unwrap();
    session.run().unwrap();

    let stream = Stream::new().unwrap();
    cuda::set_device(0).unwrap();
    session.run_async(&stream).unwrap().wait().unwrap();
    assert_eq!(
        session.output("output").unwrap().to_f32_vec().unwrap()[0],
        INPUT_ELEMENTS as f32
    );
}

#[tokio::test]
async fn run_async_resolves_as_a_future() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();

    let stream = Stream::new().unwrap();
    session.run_async(&stream).unwrap().await.unwrap();

    assert_eq!(session.state(), SessionState::Bound);
    let values = session.output("output").unwrap().to_f32_vec().unwrap();
    assert_eq!(values[2], (INPUT_ELEMENTS + 2) as f32);
}

#[test]
fn dropping_a_pending_run_settles_the_session() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();

    let stream = Stream::new().unwrap();
    let pending = session.run_async(&stream).unwrap();
    drop(pending);

    assert_eq!(session.state(), SessionState::Bound);
    assert_eq!(
        session.output("output").unwrap().to_f32_vec().unwrap()[0],
        INPUT_ELEMENTS as f32
    );
    session.destroy().unwrap();
}

#[test]
fn run_async_checks_bindings_first() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    let stream = Stream::new().unwrap();

    assert!(matches!(
        session.run_async(&stream),
        Err(Error::IncompleteBinding { .. })
    ));
}

#[test]
fn profiling_records_layer_timings() {
    let engine = classifier();
    let mut session = Session::new(&engine).unwrap();
    session.bind("input", ones()).unwrap();

    assert!(session.read_profile().unwrap().is_none());

    session.start_profiling("classifier", "batch=1").unwrap();
    session.run().unwrap();
    session.end_profiling().unwrap();
    session.run().unwrap();

    let profile = session.read_profile().unwrap().unwrap();
    assert_eq!(profile.name, "classifier");
    assert_eq!(profile.metadata, "batch=1");
    assert_eq!(profile.entries.len(), 1);
    assert_eq!(profile.entries[0].layer, "mock_reduce_output");
    assert!(profile.ended_at_ns.is_some());

    let json: serde_json::Value = serde_json::from_str(&profile.to_json().unwrap()).unwrap();
    assert_eq!(json["entries"][0]["layer"], "mock_reduce_output");

    session.disable_profiling().unwrap();
    assert!(session.read_profile().unwrap().is_none());
}

#[test]
fn execute_and_classify() {
    let engine = classifier();

    let outputs = execute_zeroed(&engine).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].name, "output");
    assert_eq!(outputs[0].data[999], 999.0);

    let outputs = execute(
        &engine,
        &[TensorInput {
            name: "input".to_string(),
            shape: vec![1, 3, 224, 224],
            data: vec![0.0; INPUT_ELEMENTS],
        }],
    )
    .unwrap();
    let scores = HostTensor::from_f32(outputs[0].shape.clone(), &outputs[0].data).unwrap();
    let top = classify(&scores, 3).unwrap();
    let indices: Vec<usize> = top[0].iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![999, 998, 997]);
}
