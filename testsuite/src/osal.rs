// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llbsp::mutex::Mutex;
use llbsp::queue::Queue;
use llbsp::semaphore::Semaphore;
use llbsp::suspend::suspension;
use llbsp::task::{Task, TaskConfig};
use llbsp::time::sleep_for;
use llbsp::{OsalError, Timeout};
use pin_utils::pin_mut;

use crate::{poll_and_assert_not_ready, poll_and_assert_ready, A_BIT};

const HELPER: TaskConfig = TaskConfig::new("helper", 4096, 5);

pub fn test_suspension_future() {
    let (resumer, suspended) = suspension::<u32>();
    futures::executor::block_on(async {
        pin_mut!(suspended);
        poll_and_assert_not_ready!(suspended);
        resumer.resume(42).unwrap();
        assert_eq!(poll_and_assert_ready!(suspended), Some(42));
    });
}

pub fn test_queue_between_tasks() {
    let queue = Arc::new(Queue::new(2).unwrap());
    assert_eq!(queue.fetch(Timeout::After(llbsp::Millis(5))), Err(OsalError::TimedOut));

    let q = Arc::clone(&queue);
    let producer = Task::spawn(&HELPER, move || {
        for i in 0..2u8 {
            q.post(i).unwrap();
        }
        assert_eq!(q.post(2), Err(OsalError::NoMemory));
    })
    .unwrap();
    producer.join().unwrap();
    assert_eq!(queue.fetch(Timeout::Forever), Ok(0));
    assert_eq!(queue.fetch(Timeout::Forever), Ok(1));
    assert!(queue.is_empty());
}

pub fn test_mutex_serializes_tasks() {
    let counter = Arc::new(Mutex::new(0usize));
    let tasks: Vec<Task> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            Task::spawn(&HELPER, move || {
                for _ in 0..100 {
                    counter.perform(|c| {
                        let seen = *c;
                        std::thread::yield_now();
                        *c = seen + 1;
                    });
                }
            })
            .unwrap()
        })
        .collect();
    for t in tasks {
        t.join().unwrap();
    }
    assert_eq!(counter.perform(|c| *c), 400);
}

pub fn test_semaphore_signals_task() {
    let ready = Arc::new(Semaphore::binary());
    let woken = Arc::new(AtomicUsize::new(0));
    let (r, w) = (Arc::clone(&ready), Arc::clone(&woken));
    let waiter = Task::spawn(&HELPER, move || {
        r.acquire(Timeout::Forever).unwrap();
        w.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    sleep_for(A_BIT);
    assert_eq!(woken.load(Ordering::SeqCst), 0);
    // Signals collapse: the second release has nowhere to go.
    ready.release();
    ready.release();
    waiter.join().unwrap();
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert!(ready.permits_available() <= 1);
}
