// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Single-threaded epoll-equivalent multiplexing over file descriptors.
//! Built on `mio` as a reusable subsystem with its own token allocation, a
//! waker-driven cross-thread task queue, and a list of post-step hooks
//! that run after every wake (primarily Wayland display/client flushes).

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

use crate::waking_sender::WakingSender;

/// An opaque handle identifying one fd registration. Removal is by this
/// token, mirroring epoll's `EPOLL_CTL_DEL` taking the fd back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(mio::Token);

/// A task enqueued from another thread (e.g. a GPU async-wait callback
/// posted from a waiter thread) to run on the event-loop thread.
pub type Task = Box<dyn FnOnce() + Send>;

const WAKER_TOKEN: mio::Token = mio::Token(usize::MAX);

/// The process's single event loop. All Wayland dispatch, all surface
/// and GPU-resource mutation, and all backend I/O happens from handlers
/// run out of `EventLoop::run`.
pub struct EventLoop {
    poll: mio::Poll,
    waker: Arc<mio::Waker>,
    next_token: usize,
    task_send: WakingSender<Task>,
    task_recv: Receiver<Task>,
    post_steps: Vec<Box<dyn FnMut() -> Result<()>>>,
    stopped: bool,
    stop_requested: Arc<AtomicBool>,
}

/// A handle that can ask a running `EventLoop` to stop from any thread
/// (e.g. a signal handler), without needing a task that could run before
/// or after the loop has already exited.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = mio::Poll::new().context("creating mio::Poll")?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (raw_send, task_recv): (Sender<Task>, Receiver<Task>) = crossbeam_channel::unbounded();
        let task_send = WakingSender::new(waker.clone(), raw_send);

        Ok(Self {
            poll,
            waker,
            next_token: 0,
            task_send,
            task_recv,
            post_steps: Vec::new(),
            stopped: false,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that can request this loop stop from any thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop_requested.clone(),
            waker: self.waker.clone(),
        }
    }

    /// A sender that can enqueue a task to run on the event-loop thread
    /// from any other thread, waking the loop out of `epoll_wait`. This is
    /// the only cross-thread operation the core performs; everything else
    /// runs single-threaded off the event loop.
    pub fn task_sender(&self) -> WakingSender<Task> {
        self.task_send.clone()
    }

    /// Registers `fd` for the given interest set, returning a token that
    /// must be used both to disambiguate this fd in `run`'s dispatch
    /// callback and to later remove it.
    pub fn register(&mut self, fd: RawFd, interest: mio::Interest) -> Result<Token> {
        let token = mio::Token(self.next_token);
        self.next_token += 1;

        self.poll
            .registry()
            .register(&mut mio::unix::SourceFd(&fd), token, interest)
            .context("registering fd with event loop")?;

        Ok(Token(token))
    }

    /// Removes a previously registered fd. `fd` must be the same
    /// descriptor passed to `register` (epoll removal is by fd, not
    /// token; mio mirrors that here).
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .deregister(&mut mio::unix::SourceFd(&fd))
            .context("deregistering fd from event loop")
    }

    /// Registers a hook that runs once per wake after every batch of
    /// events has been dispatched, regardless of which fds fired. Used
    /// for `Display::flush_clients` and similar post-step bookkeeping.
    pub fn add_post_step(&mut self, step: impl FnMut() -> Result<()> + 'static) {
        self.post_steps.push(Box::new(step));
    }

    /// Marks the loop for exit; the next `run` iteration returns `Ok(())`
    /// after running one final round of post-steps. Matches the spirit
    /// of "stopping closes the epoll fd" without relying on raw epoll
    /// teardown, which `mio::Poll` doesn't expose publicly.
    pub fn stop(&mut self) {
        self.stopped = true;
        let _ = self.waker.wake();
    }

    /// Runs the loop until `stop` is called. `dispatch` is invoked once
    /// per ready event with the token that fired (fd-specific handlers
    /// look up what the token means); waker wakeups run enqueued tasks
    /// directly and are not passed to `dispatch`.
    pub fn run(&mut self, mut dispatch: impl FnMut(Token) -> Result<()>) -> Result<()> {
        let mut events = mio::Events::with_capacity(64);

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    while let Ok(task) = self.task_recv.try_recv() {
                        task();
                    }
                    continue;
                }

                dispatch(Token(event.token()))?;
            }

            for step in &mut self.post_steps {
                step()?;
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                self.stopped = true;
            }

            trace!(stopped = self.stopped, "event loop tick complete");

            if self.stopped {
                break;
            }
        }

        Ok(())
    }
}

/// Exposes the raw fd backing the waker's eventfd, for callers that need
/// to register it in some other poller (not used by the core itself, but
/// kept narrow and explicit rather than leaking `mio::Waker`).
pub fn waker_fd(waker: &mio::Waker) -> RawFd {
    // mio's Waker has no public fd accessor on Linux; kept as a marker
    // for where such an accessor would plug in if a future backend needs
    // to multiplex the waker into a foreign event loop (e.g. the nested
    // Wayland backend's own dispatch).
    let _ = waker;
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn enqueued_task_runs_on_next_wake() {
        let mut event_loop = EventLoop::new().unwrap();
        let sender = event_loop.task_sender();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        sender
            .send(Box::new(move || ran_clone.store(true, Ordering::SeqCst)))
            .unwrap();

        // Enqueue the stop itself as a second task so both drain in the
        // same wake before `run` observes `stopped`.
        let stop_sender = event_loop.task_sender();
        let ran_for_stop = ran.clone();
        std::thread::spawn(move || {
            stop_sender.send(Box::new(move || assert!(ran_for_stop.load(Ordering::SeqCst)))).unwrap();
        })
        .join()
        .unwrap();

        event_loop.stop();
        event_loop.run(|_| Ok(())).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
