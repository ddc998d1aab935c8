use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use tfe_rs::eager::{EagerNode, ExecutionQueue};
use tfe_rs::{Code, Status, StatusResult};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Ran(&'static str),
    Aborted(&'static str, Status),
}

type Log = Arc<Mutex<Vec<Event>>>;

struct Recorded {
    name: &'static str,
    log: Log,
    gate: Option<Receiver<()>>,
    fail_with: Option<Status>,
}

impl Recorded {
    fn ok(name: &'static str, log: &Log) -> Box<dyn EagerNode> {
        Box::new(Recorded {
            name,
            log: Arc::clone(log),
            gate: None,
            fail_with: None,
        })
    }

    fn failing(name: &'static str, log: &Log, status: Status, gate: Receiver<()>) -> Box<dyn EagerNode> {
        Box::new(Recorded {
            name,
            log: Arc::clone(log),
            gate: Some(gate),
            fail_with: Some(status),
        })
    }
}

impl EagerNode for Recorded {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&mut self) -> StatusResult<()> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        self.log.lock().unwrap().push(Event::Ran(self.name));
        match self.fail_with.take() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn abort(&mut self, status: &Status) {
        self.log
            .lock()
            .unwrap()
            .push(Event::Aborted(self.name, status.clone()));
    }
}

#[test]
fn nodes_run_in_submission_order() -> anyhow::Result<()> {
    let queue = ExecutionQueue::new("ordered")?;
    let log = Log::default();
    for name in ["a", "b", "c"] {
        queue.enqueue(Recorded::ok(name, &log))?;
    }
    queue.wait()?;
    assert_eq!(
        *log.lock().unwrap(),
        vec![Event::Ran("a"), Event::Ran("b"), Event::Ran("c")]
    );
    Ok(())
}

#[test]
fn failure_aborts_queued_and_later_nodes() -> anyhow::Result<()> {
    let queue = ExecutionQueue::new("poisoned")?;
    let log = Log::default();
    let error = Status::invalid_argument("bad input [Op:First]");
    let (release, gate) = mpsc::channel();

    queue.enqueue(Recorded::failing("first", &log, error.clone(), gate))?;
    queue.enqueue(Recorded::ok("second", &log))?;
    queue.enqueue(Recorded::ok("third", &log))?;
    release.send(())?;

    assert_eq!(queue.wait().unwrap_err(), error);
    assert_eq!(queue.status().unwrap_err(), error);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            Event::Ran("first"),
            Event::Aborted("first", error.clone()),
            Event::Aborted("second", error.clone()),
            Event::Aborted("third", error.clone()),
        ]
    );

    log.lock().unwrap().clear();
    assert_eq!(queue.enqueue(Recorded::ok("late", &log)).unwrap_err(), error);
    assert_eq!(*log.lock().unwrap(), vec![Event::Aborted("late", error.clone())]);
    Ok(())
}

struct Panicking {
    gate: Receiver<()>,
}

impl EagerNode for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn run(&mut self) -> StatusResult<()> {
        let _ = self.gate.recv();
        panic!("index out of bounds");
    }

    fn abort(&mut self, _status: &Status) {}
}

#[test]
fn panicking_node_poisons_the_queue() -> anyhow::Result<()> {
    let queue = ExecutionQueue::new("panicking")?;
    let log = Log::default();
    let (release, gate) = mpsc::channel();
    queue.enqueue(Box::new(Panicking { gate }))?;
    queue.enqueue(Recorded::ok("after", &log))?;
    release.send(())?;

    let err = queue.wait().unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(err.message(), "eager node panicking panicked: index out of bounds");
    assert_eq!(*log.lock().unwrap(), vec![Event::Aborted("after", err.clone())]);
    Ok(())
}

#[test]
fn clear_error_accepts_work_again() -> anyhow::Result<()> {
    let queue = ExecutionQueue::new("recovering")?;
    let log = Log::default();
    let (release, gate) = mpsc::channel();
    release.send(())?;
    queue.enqueue(Recorded::failing("broken", &log, Status::internal("boom"), gate))?;
    assert!(queue.wait().is_err());

    queue.clear_error();
    queue.status()?;
    queue.enqueue(Recorded::ok("fresh", &log))?;
    queue.wait()?;
    assert_eq!(log.lock().unwrap().last(), Some(&Event::Ran("fresh")));
    Ok(())
}

#[test]
fn queues_are_independent() -> anyhow::Result<()> {
    let failing = ExecutionQueue::new("cpu")?;
    let healthy = ExecutionQueue::new("xla_cpu")?;
    let log = Log::default();
    let (release, gate) = mpsc::channel();
    release.send(())?;
    failing.enqueue(Recorded::failing("bad", &log, Status::internal("boom"), gate))?;
    assert!(failing.wait().is_err());

    healthy.enqueue(Recorded::ok("good", &log))?;
    healthy.wait()?;
    assert!(log.lock().unwrap().contains(&Event::Ran("good")));
    Ok(())
}

#[test]
fn failures_are_ordered_across_queues() -> anyhow::Result<()> {
    let first = ExecutionQueue::new("first-to-fail")?;
    let second = ExecutionQueue::new("second-to-fail")?;
    let log = Log::default();
    for (queue, message) in [(&first, "early"), (&second, "late")] {
        let (release, gate) = mpsc::channel();
        release.send(())?;
        queue.enqueue(Recorded::failing("bad", &log, Status::internal(message), gate))?;
        queue.wait().unwrap_err();
    }

    let (early, error) = first.wait_for_failure().ok_or_else(|| anyhow::anyhow!("first queue should fail"))?;
    assert_eq!(error.message(), "early");
    let (late, _) = second.wait_for_failure().ok_or_else(|| anyhow::anyhow!("second queue should fail"))?;
    assert!(early < late);

    first.clear_error();
    assert!(first.wait_for_failure().is_none());
    Ok(())
}

#[test]
fn dropping_a_queue_drains_its_worker() -> anyhow::Result<()> {
    let log = Log::default();
    {
        let queue = ExecutionQueue::new("short-lived")?;
        queue.enqueue(Recorded::ok("only", &log))?;
        queue.wait()?;
    }
    assert_eq!(*log.lock().unwrap(), vec![Event::Ran("only")]);
    Ok(())
}
