use {
  pry::{
    CountingAllocator, HeapDelta, JsonLinesWriter, PryError, ReportStreamWriter,
    Tracked, format_heap_delta, register_thread, spawn,
  },
  std::{
    collections::HashMap,
    io,
    sync::mpsc::{self, RecvTimeoutError},
    time::{Duration, SystemTime},
  },
  tracing_subscriber::EnvFilter,
};

#[global_allocator]
static ALLOC: CountingAllocator = CountingAllocator::system();

#[derive(Debug, Clone)]
struct Session {
  peer: String,
  requests: u32,
}

fn main() -> Result<(), PryError> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let json = std::env::args().any(|arg| arg == "--json");
  let _main = register_thread("main", false);

  let baseline = pry::collect_heap_stats();

  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  let (ready_tx, ready_rx) = mpsc::channel::<()>();

  let worker = spawn("pry-demo-worker", false, {
    let ready_tx = ready_tx.clone();
    move || {
      let sessions: Vec<Tracked<Session>> = (0..4)
        .map(|n| {
          Tracked::new(Session {
            peer: format!("10.0.0.{n}"),
            requests: n * 10,
          })
        })
        .collect();

      for session in &sessions {
        tracing::debug!(peer = %session.peer, "session opened");
      }

      let _ = ready_tx.send(());
      let _ = stop_rx.recv();

      sessions.iter().map(|session| session.requests).sum::<u32>()
    }
  })?;

  let (tick_tx, tick_rx) = mpsc::channel::<()>();
  let ticker = spawn("pry-demo-ticker", true, move || {
    let _ = ready_tx.send(());
    let mut ticks = 0_u64;
    while let Err(RecvTimeoutError::Timeout) =
      tick_rx.recv_timeout(Duration::from_millis(50))
    {
      ticks += 1;
    }
    ticks
  })?;

  for _ in 0..2 {
    let _ = ready_rx.recv();
  }

  let mut index: Tracked<HashMap<String, u32>> = Tracked::default();
  index.insert("alpha".to_string(), 1);
  index.insert("beta".to_string(), 2);

  let buffers: Vec<Tracked<Vec<u8>>> =
    (0..3).map(|n| Tracked::new(vec![0; 64 * (n + 1)])).collect();

  let threads = pry::collect_thread_stacks();
  let heap = pry::collect_heap_stats_with_averages();

  if json {
    let mut writer = JsonLinesWriter::new(io::stdout().lock());
    let now = Some(SystemTime::now());
    writer.write_threads(&threads, now)?;
    writer.write_heap(&heap, now)?;
  } else {
    println!("{}", pry::format_thread_stacks(&threads));
    println!("{}", pry::format_heap_stats(&heap));
    println!(
      "{}",
      format_heap_delta(&HeapDelta::between(&heap, &baseline))
    );
  }

  let _ = stop_tx.send(());
  drop(tick_tx);

  let requests = worker.join().unwrap_or_default();
  let ticks = ticker.join().unwrap_or_default();

  tracing::info!(
    requests,
    ticks,
    index = index.len(),
    buffers = buffers.len(),
    "demo finished"
  );

  Ok(())
}
