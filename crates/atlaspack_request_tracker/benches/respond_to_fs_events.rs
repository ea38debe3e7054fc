use atlaspack_request_tracker::{
  RequestEdgeType, RequestGraph, RequestGraphNode, RequestNode, WatchEvent,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::PathBuf;

/// A parent per `fan_out` requests, every request watching `files_per_request` shared files
fn create_graph(requests: usize, fan_out: usize, files_per_request: usize) -> RequestGraph<String> {
  let mut graph = RequestGraph::new();
  let root = graph.root();
  let mut parent = root;

  for i in 0..requests {
    let request = graph.add_node(RequestGraphNode::Request(RequestNode::new(
      format!("request_{i:06}"),
      String::from("bench"),
    )));

    if i % fan_out == 0 {
      graph
        .add_edge(root, request, RequestEdgeType::SubRequest)
        .unwrap();
      parent = request;
    } else {
      graph
        .add_edge(parent, request, RequestEdgeType::SubRequest)
        .unwrap();
    }

    for f in 0..files_per_request {
      let file = graph.add_node(RequestGraphNode::File {
        path: PathBuf::from(format!("src/file_{:06}.js", (i + f * 7) % requests)),
      });
      graph
        .add_edge(request, file, RequestEdgeType::InvalidatedByUpdate)
        .unwrap();
    }
  }

  graph
}

fn create_events(count: usize, requests: usize) -> Vec<WatchEvent> {
  (0..count)
    .map(|i| WatchEvent::update(format!("src/file_{:06}.js", (i * 13) % requests)))
    .collect()
}

fn benchmark_respond_to_fs_events(c: &mut Criterion) {
  // ATLASPACK_TRACING_MODE=chrome records a profile of the runs
  atlaspack_monitoring::initialize_from_env().unwrap();

  let mut group = c.benchmark_group("respond_to_fs_events");
  let requests = 10_000;

  for event_count in [10, 1_000] {
    let events = create_events(event_count, requests);

    for budget in [None, Some(64)] {
      let label = match budget {
        Some(budget) => format!("events_{event_count}_budget_{budget}"),
        None => format!("events_{event_count}_unbounded"),
      };

      group.bench_with_input(BenchmarkId::new(label, requests), &events, |b, events| {
        b.iter_batched(
          || create_graph(requests, 50, 4),
          |mut graph| black_box(graph.respond_to_fs_events(events, budget)),
          criterion::BatchSize::LargeInput,
        );
      });
    }
  }

  group.finish();
}

criterion_group!(benches, benchmark_respond_to_fs_events);
criterion_main!(benches);
