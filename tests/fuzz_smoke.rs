//! End-to-end smoke test: the whole generational loop against a stub
//! wire collaborator and a trivial target command.

use std::{
    env, fs,
    sync::{atomic::Ordering, Arc},
    thread,
    time::Duration,
};

use evofuzz::{
    agent::TargetExecutor,
    config::EngineConfig,
    corpus::Verdict,
    fuzzer::{Fuzzer, Worker},
    trace::{Action, ConnectionEnd, Message, MessageType, Trace},
    Error,
};

/// Answers the first exchange with an early heartbeat, then behaves.
struct FlakyTarget {
    calls: u64,
}

impl TargetExecutor for FlakyTarget {
    fn execute_trace(&mut self, _trace: &Trace) -> Result<Trace, Error> {
        self.calls += 1;
        let messages = if self.calls == 1 {
            vec![
                Message::new(MessageType::ServerHello, ConnectionEnd::Server),
                Message::new(MessageType::Heartbeat, ConnectionEnd::Server),
            ]
        } else {
            vec![
                Message::new(MessageType::ServerHello, ConnectionEnd::Server),
                Message::new(MessageType::Finished, ConnectionEnd::Server),
            ]
        };
        Ok(Trace {
            actions: vec![Action::Receive { messages }],
            description: None,
        })
    }
}

fn smoke_config(tag: &str) -> Arc<EngineConfig> {
    let root = env::temp_dir().join(format!("evofuzz-smoke-{tag}"));
    fs::remove_dir_all(&root).ok();
    Arc::new(
        EngineConfig::builder()
            .command("true [output] [id] [cert] [key]")
            .output_dir(root.join("out"))
            .findings_dir(root.join("findings"))
            .cert_file("cert.pem")
            .key_file("key.pem")
            .map_len(64)
            .exec_timeout(Duration::from_secs(5))
            .seed(0xC0FFEE)
            .build(),
    )
}

#[test]
fn test_single_worker_finds_and_reports_the_heartbeat() {
    let config = smoke_config("single");
    let fuzzer = Fuzzer::new(Arc::clone(&config)).unwrap();
    let mut worker = Worker::new(0, &config, Box::new(FlakyTarget { calls: 0 })).unwrap();

    let mut retained = 0;
    for _ in 0..10 {
        let outcome = fuzzer.fuzz_one(&mut worker).unwrap();
        if matches!(outcome.verdict, Verdict::Retained(_)) {
            retained += 1;
        }
    }
    // the first generation's early heartbeat must have been kept
    assert!(retained >= 1);

    let report = fuzzer.report();
    assert!(report.contains("heartbeat"), "report was: {report}");

    let findings = config.findings_dir.join("early_heartbeat");
    let persisted: Vec<_> = fs::read_dir(&findings).unwrap().collect();
    assert_eq!(persisted.len(), 1);

    // the persisted finding is a loadable, annotated trace
    let entry = persisted.into_iter().next().unwrap().unwrap();
    let finding = Trace::load(entry.path()).unwrap();
    assert!(finding.description.is_some());
}

#[test]
fn test_multi_worker_loop_stops_cooperatively() {
    let config = smoke_config("multi");
    let fuzzer = Fuzzer::new(Arc::clone(&config)).unwrap();

    let workers = (0..2)
        .map(|idx| Worker::new(idx, &config, Box::new(FlakyTarget { calls: 0 }) as _).unwrap())
        .collect::<Vec<_>>();

    let stop = fuzzer.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stop.store(true, Ordering::Relaxed);
    });

    fuzzer.fuzz_loop_multi(workers);
    stopper.join().unwrap();

    // both workers went through at least the seeded generation
    assert!(fuzzer.corpus().with(|corpus| corpus.len()) >= 1);
}
