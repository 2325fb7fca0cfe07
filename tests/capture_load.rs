//! End-to-end load scenarios over byte-level capture files.

mod common;

use common::{CaptureBuilder, TestResolver};
use heapscope::{histogram_bin_index, Capture, CaptureError, LoadOutcome, OpKind, OpRef};

fn load(bytes: &[u8]) -> Capture {
    let mut capture = Capture::new();
    let outcome = capture
        .load_reader(bytes, Some(bytes.len() as u64), &TestResolver::new())
        .expect("load should succeed");
    assert_eq!(outcome, LoadOutcome::Complete);
    capture
}

#[test]
fn single_alloc_free() {
    let mut b = CaptureBuilder::new();
    b.alloc(1, 7, 0x1000, 100, 64, 8, &[0x10, 0x20]);
    b.free(1, 7, 0x1000, 200, &[0x30]);
    let capture = load(&b.build());

    assert_eq!(capture.operations().len(), 2);
    assert_eq!(capture.invalid_operation_count(), 0);

    let alloc = capture.operation(capture.operations()[0]);
    let free = capture.operation(capture.operations()[1]);
    assert_eq!(alloc.kind, OpKind::Alloc);
    assert_eq!(free.kind, OpKind::Free);
    assert_eq!(alloc.chain_next, capture.operations()[1]);
    assert_eq!(free.chain_prev, capture.operations()[0]);
    assert_eq!(free.alloc_size, 64);
    assert_eq!(free.overhead, 8);

    assert_eq!(capture.min_time(), 100);
    assert_eq!(capture.max_time(), 200);

    let stats = capture.global_stats();
    assert_eq!(stats.memory_usage, 0);
    assert_eq!(stats.memory_usage_peak, 64);
    assert_eq!(stats.number_of_live_blocks, 0);

    let populated: Vec<usize> = stats
        .histogram
        .iter()
        .enumerate()
        .filter(|(_, bin)| bin.count_peak > 0)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(populated, vec![histogram_bin_index(64)]);

    assert!(capture.leaks().is_empty());
    assert!(stats.verify());
}

#[test]
fn realloc_chain_with_zero_size_shrink() {
    let mut b = CaptureBuilder::new();
    b.alloc(1, 7, 0xa, 10, 32, 0, &[0x10]);
    b.realloc(1, 7, 0xb, 0xa, 20, 64, 0, &[0x10]);
    b.realloc(1, 7, 0xc, 0xb, 30, 0, 0, &[0x10]);
    let capture = load(&b.build());

    assert_eq!(capture.operations().len(), 3);
    let ops: Vec<OpRef> = capture.operations().to_vec();
    assert_eq!(capture.operation(ops[0]).chain_next, ops[1]);
    assert_eq!(capture.operation(ops[1]).chain_prev, ops[0]);
    assert_eq!(capture.operation(ops[1]).chain_next, ops[2]);
    assert_eq!(capture.operation(ops[2]).chain_prev, ops[1]);

    // the final zero-size realloc is effectively a free
    assert!(!capture.operation(ops[2]).is_leaked());
    assert!(capture.leaks().is_empty());

    let stats = capture.global_stats();
    assert_eq!(stats.number_of_live_blocks, 0);
    assert_eq!(stats.memory_usage, 0);
    assert_eq!(stats.memory_usage_peak, 64);
}

#[test]
fn duplicate_pointer_alloc_without_free() {
    let mut b = CaptureBuilder::new();
    b.alloc(1, 7, 0xa, 10, 8, 0, &[0x10]);
    b.alloc(1, 7, 0xa, 20, 16, 0, &[0x20]);
    let capture = load(&b.build());

    assert_eq!(capture.operations().len(), 1);
    assert_eq!(capture.invalid_operation_count(), 1);
    assert_eq!(capture.leaks().len(), 1);
    assert_eq!(capture.operation(capture.leaks()[0]).alloc_size, 8);
}

#[test]
fn orphan_free_fails_with_no_operations() {
    let mut b = CaptureBuilder::new();
    b.free(1, 7, 0xdead, 5, &[0x10]);
    let bytes = b.build();

    let mut capture = Capture::new();
    let result = capture.load_reader(&bytes[..], Some(bytes.len() as u64), &TestResolver::new());
    assert!(matches!(result, Err(CaptureError::NoOperations)));
    // failed loads clear all state
    assert!(capture.operations().is_empty());
    assert!(capture.usage_graph().is_empty());
}

#[test]
fn tag_enter_leave_scopes_allocations() {
    let mut b = CaptureBuilder::new();
    b.register_tag("A", "", 0xaa, 0);
    b.enter_tag(0xaa, 1);
    b.alloc(1, 1, 0x1, 1, 4, 0, &[0x10]);
    b.leave_tag(0xaa, 1);
    b.alloc(1, 1, 0x2, 2, 4, 0, &[0x10]);
    let capture = load(&b.build());

    assert_eq!(capture.operation(capture.operations()[0]).tag, 0xaa);
    assert_eq!(capture.operation(capture.operations()[1]).tag, 0);

    let node = capture.tag_tree().find(0xaa).expect("tag registered");
    assert_eq!(capture.tag_tree().node(node).name, "A");
    assert_eq!(capture.tag_tree().node(node).op_count, 1);
    assert_eq!(capture.tag_tree().root().op_count, 1);
}

#[test]
fn truncated_tail_loads_partial() {
    let mut b = CaptureBuilder::new();
    b.alloc(1, 7, 0x1000, 100, 64, 8, &[0x10]);
    b.raw(&[heapscope::loader::parser::tags::OP_ALLOC]); // cut mid-record
    let bytes = b.build();

    let mut capture = Capture::new();
    let outcome = capture
        .load_reader(&bytes[..], Some(bytes.len() as u64), &TestResolver::new())
        .expect("partial load");
    assert_eq!(outcome, LoadOutcome::Partial);
    assert_eq!(capture.operations().len(), 1);
    assert!(capture.global_stats().verify());
}

#[test]
fn corrupt_stream_without_operations_fails() {
    let mut b = CaptureBuilder::new();
    b.raw(&[0xfe]); // unknown record tag
    b.raw(&[0u8; 2000]); // well outside the tail tolerance window
    let bytes = b.build();

    let mut capture = Capture::new();
    let result = capture.load_reader(&bytes[..], Some(bytes.len() as u64), &TestResolver::new());
    assert!(matches!(result, Err(CaptureError::CorruptRecord { .. })));
}

#[test]
fn unsupported_version_is_rejected() {
    let b = CaptureBuilder::new();
    let mut bytes = b.build();
    bytes[2] = 2; // version high

    let mut capture = Capture::new();
    let result = capture.load_reader(&bytes[..], Some(bytes.len() as u64), &TestResolver::new());
    assert!(matches!(result, Err(CaptureError::VersionUnsupported { high: 2, low: 2 })));
}

fn fill_scenario(b: &mut CaptureBuilder) {
    b.register_tag("render", "", 0xaa, 0);
    b.enter_tag(0xaa, 3);
    b.alloc(1, 3, 0x1000, 100, 64, 8, &[0x5000, 0x6000]);
    b.alloc(2, 4, 0x2000, 150, 100, 4, &[0x5000, 0x7000]);
    b.leave_tag(0xaa, 3);
    b.realloc(1, 3, 0x1100, 0x1000, 200, 128, 8, &[0x5000, 0x6000]);
    b.free(2, 4, 0x2000, 250, &[0x7000]);
    b.register_marker("frame", 0xbeef, 0xff0000);
    b.marker(0xbeef, 3, 120);
    b.allocator("gpu", 2);
}

#[test]
fn endian_round_trip_yields_equal_aggregates() {
    let mut le = CaptureBuilder::new();
    fill_scenario(&mut le);
    let mut be = CaptureBuilder::new().big_endian();
    fill_scenario(&mut be);

    let little = load(&le.build());
    let big = load(&be.build());

    assert!(big.is_big_endian());
    assert!(!little.is_big_endian());
    assert_eq!(little.global_stats(), big.global_stats());
    assert_eq!(little.usage_graph(), big.usage_graph());
    assert_eq!(little.leaks().len(), big.leaks().len());
    assert_eq!(little.heaps(), big.heaps());
    assert_eq!(little.min_time(), big.min_time());
    assert_eq!(little.max_time(), big.max_time());
    assert_eq!(little.markers(), big.markers());
}

#[test]
fn compressed_capture_equals_uncompressed() {
    let mut b = CaptureBuilder::new();
    fill_scenario(&mut b);

    let plain = load(&b.build());

    let compressed_bytes = b.build_compressed();
    let mut compressed = Capture::new();
    let outcome = compressed
        .load_reader(&compressed_bytes[..], Some(compressed_bytes.len() as u64), &TestResolver::new())
        .expect("compressed load");
    assert_eq!(outcome, LoadOutcome::Complete);

    assert_eq!(plain.global_stats(), compressed.global_stats());
    assert_eq!(plain.usage_graph(), compressed.usage_graph());
    assert_eq!(plain.operations().len(), compressed.operations().len());
}

#[test]
fn reload_reproduces_identical_state() {
    let mut b = CaptureBuilder::new();
    fill_scenario(&mut b);
    let bytes = b.build();
    let resolver = TestResolver::new();

    let mut capture = Capture::new();
    capture.load_reader(&bytes[..], Some(bytes.len() as u64), &resolver).unwrap();
    let stats_first = *capture.global_stats();
    let graph_first = capture.usage_graph().to_vec();
    let groups_first = capture.global_groups().len();
    let timed_first = capture.timed_stats().to_vec();

    capture.clear_data();
    capture.load_reader(&bytes[..], Some(bytes.len() as u64), &resolver).unwrap();

    assert_eq!(*capture.global_stats(), stats_first);
    assert_eq!(capture.usage_graph(), graph_first);
    assert_eq!(capture.global_groups().len(), groups_first);
    assert_eq!(capture.timed_stats(), timed_first);
}

#[test]
fn marker_before_first_op_extends_min_time() {
    let mut b = CaptureBuilder::new();
    b.register_marker("boot", 0x1, 0);
    b.marker(0x1, 1, 50);
    b.alloc(1, 1, 0x1000, 100, 8, 0, &[0x10]);
    let capture = load(&b.build());

    assert_eq!(capture.min_time(), 50);
    assert_eq!(capture.max_time(), 100);
    assert_eq!(capture.marker_timeline().len(), 1);
}

#[test]
fn heaps_named_by_allocator_records() {
    let mut b = CaptureBuilder::new();
    b.alloc(0x42, 1, 0x1000, 10, 8, 0, &[0x10]);
    b.alloc(0x43, 1, 0x2000, 20, 8, 0, &[0x10]);
    b.allocator("main heap", 0x42);
    let capture = load(&b.build());

    assert_eq!(capture.heaps().get(&0x42).unwrap(), "main heap");
    assert_eq!(capture.heaps().get(&0x43).unwrap(), "0x43");
}

#[test]
fn module_table_and_module_events_are_merged() {
    let mut b = CaptureBuilder::new()
        .with_module("C:\\game\\bin\\..\\app.exe", 0x40_0000, 0x10_0000)
        .with_module("/game/libaudio.so", 0x7f00_0000, 0x1000);
    b.module_event("/game/libphysics.so", 0x7f10_0000, 0x2000);
    b.module_event("/game/libaudio.so", 0x7f00_0000, 0x1000); // duplicate
    b.alloc(1, 1, 0x1000, 10, 8, 0, &[0x10]);
    let capture = load(&b.build());

    let paths: Vec<&str> = capture.modules().iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["C:/game/app.exe", "/game/libaudio.so", "/game/libphysics.so"]);
}

#[test]
fn pointers_32bit_are_zero_extended() {
    let mut b = CaptureBuilder::new().pointers_32bit();
    b.alloc(1, 1, 0xdead_beef, 10, 8, 0, &[0x8000_0010]);
    b.free(1, 1, 0xdead_beef, 20, &[0x8000_0020]);
    let capture = load(&b.build());

    assert_eq!(capture.operations().len(), 2);
    assert_eq!(capture.operation(capture.operations()[0]).pointer, 0xdead_beef);
    let trace = capture.operation(capture.operations()[0]).stack_trace;
    assert_eq!(capture.trace_pool().addresses(trace), &[0x8000_0010]);
}

#[test]
fn aligned_ops_carry_alignment() {
    let mut b = CaptureBuilder::new();
    b.alloc_aligned(1, 1, 0x1000, 10, 6, 64, 0, &[0x10]);
    b.alloc(1, 1, 0x2000, 20, 8, 0, &[0x10]);
    let capture = load(&b.build());

    assert_eq!(capture.operation(capture.operations()[0]).alignment, 6);
    assert_eq!(capture.operation(capture.operations()[1]).alignment, heapscope::domain::UNALIGNED);
}

#[test]
fn shared_stack_records_intern_to_one_trace() {
    let frames = [0x10u64, 0x20];
    let mut b = CaptureBuilder::new();
    b.alloc(1, 1, 0x1000, 10, 8, 0, &frames);
    b.alloc_shared_stack(1, 1, 0x2000, 20, 8, 0, &frames);
    let capture = load(&b.build());

    assert_eq!(capture.stack_traces().len(), 1);
    let a = capture.operation(capture.operations()[0]).stack_trace;
    let b2 = capture.operation(capture.operations()[1]).stack_trace;
    assert_eq!(a, b2);

    // both ops therefore aggregate into one group
    assert_eq!(capture.global_groups().len(), 1);
    assert_eq!(capture.global_groups()[&a].count, 2);
}

#[test]
fn progress_reports_end_with_done() {
    use std::sync::{Arc, Mutex};
    let messages: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&messages);

    let mut b = CaptureBuilder::new();
    b.alloc(1, 1, 0x1000, 10, 8, 0, &[0x10]);
    let bytes = b.build();

    let mut capture = Capture::new();
    capture.set_progress_callback(Box::new(move |_, msg| {
        sink.lock().unwrap().push(msg.to_string());
    }));
    capture.load_reader(&bytes[..], Some(bytes.len() as u64), &TestResolver::new()).unwrap();

    let messages = messages.lock().unwrap();
    assert_eq!(messages.last().map(String::as_str), Some("Done!"));
}
