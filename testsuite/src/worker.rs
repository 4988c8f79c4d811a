// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use llbsp::task::{Task, TaskConfig};
use llbsp_worker::{Allocation, AsyncWorker, WorkerConfig};

#[derive(Debug, Default)]
struct Lookup {
    name: String,
    address: Option<[u8; 4]>,
}

pub fn test_exec_and_resume() {
    let worker = AsyncWorker::<Lookup>::initialize(WorkerConfig::default()).unwrap();
    let mut job = worker.allocate_job_blocking().unwrap();
    job.params.name = "localhost".to_string();

    let done = worker
        .async_exec(job, |p| {
            if p.name == "localhost" {
                p.address = Some([127, 0, 0, 1]);
            }
        })
        .unwrap();
    let job = done.wait().expect("worker dropped the job");
    assert_eq!(job.params.address, Some([127, 0, 0, 1]));
    worker.free_job(job).unwrap();
    assert_eq!(worker.jobs_in_use(), 0);
}

pub fn test_waiting_list_order() {
    let worker = Arc::new(
        AsyncWorker::<u32>::initialize(WorkerConfig {
            job_count: 1,
            waiting_threads: 4,
            ..WorkerConfig::default()
        })
        .unwrap(),
    );
    let held = worker.allocate_job_blocking().unwrap();

    // Queue up three threads, strictly one after the other.
    let (order_tx, order_rx) = mpsc::channel();
    let mut tasks = Vec::new();
    for i in 0..3u32 {
        let w = Arc::clone(&worker);
        let order = order_tx.clone();
        let (queued_tx, queued_rx) = mpsc::channel();
        tasks.push(
            Task::spawn(&TaskConfig::new("waiter", 4096, 5), move || {
                let wait = match w.allocate_job().unwrap() {
                    Allocation::Wait(s) => s,
                    Allocation::Job(_) => panic!("job should have been taken"),
                };
                queued_tx.send(()).unwrap();
                wait.wait().unwrap();
                let job = w.allocate_job_blocking().unwrap();
                order.send(i).unwrap();
                w.free_job(job).unwrap();
            })
            .unwrap(),
        );
        queued_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    assert_eq!(worker.waiting_threads(), 3);

    worker.free_job(held).unwrap();
    let order: Vec<u32> = (0..3)
        .map(|_| order_rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(order, [0, 1, 2]);
    for t in tasks {
        t.join().unwrap();
    }
}
