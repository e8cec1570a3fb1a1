// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

//! Instrumented in-memory display handle for tests.

use crate::handle::{DisplayHandle, Poll, Poller};
use crate::Error;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug)]
enum Wake {
    Ready,
    Fail,
}

#[derive(Debug, Default)]
struct Wakeups {
    queue: VecDeque<Wake>,
    interrupted: bool,
}

/// Shared record of everything the actor did to a [`FakeHandle`].
#[derive(Debug, Default)]
pub struct Recorder {
    pub outputs: AtomicUsize,
    set_color_calls: AtomicUsize,
    blocking_dispatches: AtomicUsize,
    destroyed: AtomicUsize,
    in_set_color: AtomicBool,
    overlapped: AtomicBool,
    fail_next: AtomicBool,
    panic_next: AtomicBool,
    delay: Mutex<Duration>,
    applied: Mutex<Vec<(u32, f32)>>,
    threads: Mutex<HashSet<ThreadId>>,
    wakeups: Mutex<Wakeups>,
    condvar: Condvar,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next blocking wait report activity.
    pub fn wake(&self) {
        self.push(Wake::Ready);
    }

    /// Makes the next blocking wait fail permanently.
    pub fn fail_poll(&self) {
        self.push(Wake::Fail);
    }

    pub fn fail_next_set_color(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn panic_next_set_color(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn set_color_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_color_calls(&self) -> usize {
        self.set_color_calls.load(Ordering::SeqCst)
    }

    pub fn blocking_dispatches(&self) -> usize {
        self.blocking_dispatches.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<(u32, f32)> {
        self.applied.lock().unwrap().clone()
    }

    /// Number of distinct threads that called into the handle.
    pub fn calling_threads(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    fn push(&self, wake: Wake) {
        self.wakeups.lock().unwrap().queue.push_back(wake);
        self.condvar.notify_all();
    }

    fn record_thread(&self) {
        self.threads.lock().unwrap().insert(thread::current().id());
    }
}

pub struct FakeHandle {
    recorder: Arc<Recorder>,
}

impl FakeHandle {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        Self { recorder }
    }
}

impl DisplayHandle for FakeHandle {
    type Poller = FakePoller;

    fn poller(&self) -> Result<FakePoller, Error> {
        self.recorder.record_thread();
        Ok(FakePoller {
            recorder: self.recorder.clone(),
        })
    }

    fn dispatch_pending(&mut self) -> Result<usize, Error> {
        self.recorder.record_thread();
        Ok(0)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.recorder.record_thread();
        Ok(())
    }

    fn blocking_dispatch(&mut self) -> Result<usize, Error> {
        self.recorder.record_thread();
        self.recorder.blocking_dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    fn num_ready_outputs(&self) -> usize {
        self.recorder.record_thread();
        self.recorder.outputs.load(Ordering::SeqCst)
    }

    fn set_color(&mut self, temperature: u32, _gamma: [f32; 3], brightness: f32) -> Result<(), Error> {
        self.recorder.record_thread();

        if self.recorder.panic_next.swap(false, Ordering::SeqCst) {
            panic!("fake gamma control panicked");
        }

        if self.recorder.in_set_color.swap(true, Ordering::SeqCst) {
            self.recorder.overlapped.store(true, Ordering::SeqCst);
        }

        self.recorder.set_color_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.recorder.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let result = if self.recorder.fail_next.swap(false, Ordering::SeqCst) {
            Err(Error::Protocol("fake gamma control failed".into()))
        } else {
            self.recorder.applied.lock().unwrap().push((temperature, brightness));
            Ok(())
        };

        self.recorder.in_set_color.store(false, Ordering::SeqCst);

        result
    }

    fn interrupt(&self) {
        self.recorder.record_thread();
        self.recorder.wakeups.lock().unwrap().interrupted = true;
        self.recorder.condvar.notify_all();
    }

    fn destroy(self) {
        self.recorder.record_thread();
        self.recorder.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakePoller {
    recorder: Arc<Recorder>,
}

impl Poller for FakePoller {
    fn poll(&mut self) -> Poll {
        let mut wakeups = self.recorder.wakeups.lock().unwrap();

        loop {
            if wakeups.interrupted {
                return Poll::Interrupted;
            }

            match wakeups.queue.pop_front() {
                Some(Wake::Ready) => return Poll::Ready,
                Some(Wake::Fail) => {
                    return Poll::Failed(std::io::Error::other("fake poll failure"));
                }
                None => wakeups = self.recorder.condvar.wait(wakeups).unwrap(),
            }
        }
    }
}
