//! A miniature decode loop: embed, argmax, feed the ids back. Inputs are
//! written on CQ1 and the replay runs on CQ0, ordered only by events.

use meshinfer::{
    ArgmaxOps, DType, EmbedOps, ErrorKind, HostBuffer, HostData, Layout, MeshControl, QueueId,
    TensorIo, TensorSpec,
};
use meshinfer_sim::{MeshConfig, SimBackend, SimMesh, SimTensor};

const VOCAB: usize = 4;

/// Row `r` peaks at column `(r + 1) % VOCAB`, so each step advances ids by one.
fn successor_table(mesh: &SimMesh) -> SimTensor {
    let mut data = vec![0.0_f32; VOCAB * VOCAB];
    for r in 0..VOCAB {
        data[r * VOCAB + (r + 1) % VOCAB] = 1.0;
    }
    SimBackend::from_host(mesh, &[VOCAB, VOCAB], HostData::F32(data), TensorSpec::new(DType::F32)).unwrap()
}

fn ids(mesh: &SimMesh, values: Vec<u32>) -> SimTensor {
    SimBackend::from_host(mesh, &[1, 4], HostData::U32(values), TensorSpec::new(DType::U32).row_major())
        .unwrap()
}

fn step(tokens: &SimTensor, table: &SimTensor, out: &SimTensor) {
    let x = SimBackend::embedding(tokens, table, Layout::RowMajor).unwrap();
    SimBackend::argmax_into(&x, out).unwrap();
}

#[test]
fn traced_loop_matches_eager() {
    let mesh = SimMesh::open(MeshConfig::with_grid(1, 2)).unwrap();
    mesh.enable_program_cache();
    let table = successor_table(&mesh);
    let tokens = ids(&mesh, vec![0, 1, 2, 3]);
    let out = ids(&mesh, vec![0; 4]);

    step(&tokens, &table, &out);
    assert_eq!(SimBackend::to_host(&out).unwrap(), HostData::U32(vec![1, 2, 3, 0]));
    let compiled = mesh.program_cache_entries();

    let trace = mesh.begin_trace_capture(QueueId::COMPUTE).unwrap();
    step(&tokens, &table, &out);
    mesh.end_trace_capture(QueueId::COMPUTE, trace).unwrap();
    assert_eq!(mesh.program_cache_entries(), compiled);

    let op_event = mesh.create_event();
    let write_event = mesh.create_event();
    let mut host = vec![1, 2, 3, 0];
    for _ in 0..3 {
        mesh.wait_for_event(QueueId::TRANSFER, &op_event).unwrap();
        SimBackend::copy_host_to_device(QueueId::TRANSFER, HostData::U32(host.clone()), &tokens).unwrap();
        mesh.record_event(QueueId::TRANSFER, &write_event).unwrap();

        mesh.wait_for_event(QueueId::COMPUTE, &write_event).unwrap();
        mesh.execute_trace(QueueId::COMPUTE, trace, false).unwrap();
        mesh.record_event(QueueId::COMPUTE, &op_event).unwrap();

        let landing = HostBuffer::new();
        mesh.wait_for_event(QueueId::TRANSFER, &op_event).unwrap();
        SimBackend::read_async(QueueId::TRANSFER, &out, &landing).unwrap();
        mesh.record_event(QueueId::TRANSFER, &write_event).unwrap();
        mesh.event_synchronize(&write_event).unwrap();

        let next = landing.take().unwrap().into_u32().unwrap();
        let expected: Vec<u32> = host.iter().map(|t| (t + 1) % VOCAB as u32).collect();
        assert_eq!(next, expected);
        host = next;
    }
    assert_eq!(host, vec![0, 1, 2, 3]);
}

#[test]
fn capture_of_uncompiled_program_fails() {
    let mesh = SimMesh::open(MeshConfig::default()).unwrap();
    mesh.enable_program_cache();
    let table = successor_table(&mesh);
    let tokens = ids(&mesh, vec![0, 1, 2, 3]);
    let trace = mesh.begin_trace_capture(QueueId::COMPUTE).unwrap();
    let err = SimBackend::embedding(&tokens, &table, Layout::RowMajor).unwrap_err();
    assert!(matches!(err, meshinfer::Error::ProgramNotCompiled(_)));
    mesh.end_trace_capture(QueueId::COMPUTE, trace).unwrap();
}

#[test]
fn freeing_a_bound_buffer_invalidates_the_trace() {
    let mesh = SimMesh::open(MeshConfig::default()).unwrap();
    mesh.enable_program_cache();
    let table = successor_table(&mesh);
    let tokens = ids(&mesh, vec![0, 1, 2, 3]);
    let out = ids(&mesh, vec![0; 4]);
    step(&tokens, &table, &out);
    let trace = mesh.begin_trace_capture(QueueId::COMPUTE).unwrap();
    step(&tokens, &table, &out);
    mesh.end_trace_capture(QueueId::COMPUTE, trace).unwrap();

    SimBackend::deallocate(&out);
    let err = mesh.execute_trace(QueueId::COMPUTE, trace, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TraceInvalidated);
}
