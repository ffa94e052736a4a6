//! Single-threaded reactor hosting the non-blocking sockets of a router.
//!
//! All sockets live inside one dedicated thread driven by a `mio::Poll`.
//! Other threads interact with the loop through a command channel plus a
//! `mio::Waker`: fire-and-forget closures, a dedicated message-send
//! command for the hot path, and a synchronous submission that blocks the
//! caller until the closure has run inside the loop.

use std::{
  io,
  sync::{mpsc, Arc, Condvar, Mutex},
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{Events, Poll, Token, Waker};

use crate::{
  error::{Error, Result},
  message::Message,
  worker::WorkerHandle,
};
use super::socket_manager::SocketManager;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

pub(crate) enum LoopCommand {
  /// Run a closure inside the loop.
  Run(Box<dyn FnOnce(&mut SocketManager) + Send>),
  /// Send a message to a peer context (hot path, no closure allocation).
  Send(Message),
  /// Leave the loop.
  Stop,
}

struct SubmitShared<R> {
  state: Mutex<Option<Result<R>>>,
  cond: Condvar,
}

/// One-shot completion handle for a synchronous submission.
///
/// If the loop stops before the submitted closure runs, the command is
/// dropped and the `Drop` impl completes the waiter with an error instead
/// of leaving it blocked forever.
struct SubmitCompletion<R>(Option<Arc<SubmitShared<R>>>);

impl<R> SubmitCompletion<R> {
  fn complete(mut self, result: Result<R>) {
    if let Some(shared) = self.0.take() {
      *shared.state.lock().unwrap() = Some(result);
      shared.cond.notify_all();
    }
  }
}

impl<R> Drop for SubmitCompletion<R> {
  fn drop(&mut self) {
    if let Some(shared) = self.0.take() {
      *shared.state.lock().unwrap() = Some(Err(Error::InvalidOperation(
        "event loop stopped before operation completed".to_string(),
      )));
      shared.cond.notify_all();
    }
  }
}

/// Handle on a running event-loop thread.
pub(crate) struct EventLoopHandle {
  sender: mpsc::Sender<LoopCommand>,
  waker: Arc<Waker>,
  worker: Mutex<Option<WorkerHandle>>,
}

impl EventLoopHandle {
  /// Create the poll, spawn the reactor thread and hand it the socket
  /// manager produced by `make_sockets` (which receives the poll
  /// registry).
  pub fn start(
    make_sockets: impl FnOnce(&mio::Registry) -> io::Result<SocketManager>,
  ) -> Result<Self> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let sockets = make_sockets(poll.registry())?;
    let (sender, receiver) = mpsc::channel();

    let shutdown_sender = sender.clone();
    let shutdown_waker = Arc::clone(&waker);
    let worker = WorkerHandle::spawn(
      "mesh-event-loop",
      move || run_loop(poll, receiver, sockets),
      move || {
        // Losing the race against a finished loop is harmless.
        let _ = shutdown_sender.send(LoopCommand::Stop);
        if let Err(e) = shutdown_waker.wake() {
          warn!("can not wake event loop for shutdown: {e}");
        }
      },
    )?;

    Ok(Self {
      sender,
      waker,
      worker: Mutex::new(Some(worker)),
    })
  }

  fn push(&self, command: LoopCommand) -> Result<()> {
    self
      .sender
      .send(command)
      .map_err(|_| Error::InvalidOperation("event loop not running".to_string()))?;
    self.waker.wake()?;
    Ok(())
  }

  /// Run `f` inside the loop soon; no result.
  pub fn submit(&self, f: impl FnOnce(&mut SocketManager) + Send + 'static) -> Result<()> {
    self.push(LoopCommand::Run(Box::new(f)))
  }

  /// Queue a message for transmission by the loop.
  pub fn submit_send(&self, message: Message) -> Result<()> {
    self.push(LoopCommand::Send(message))
  }

  /// Run `f` inside the loop and block until it returns, surfacing its
  /// result to the caller.
  pub fn submit_wait<R: Send + 'static>(
    &self,
    f: impl FnOnce(&mut SocketManager) -> Result<R> + Send + 'static,
  ) -> Result<R> {
    let shared = Arc::new(SubmitShared {
      state: Mutex::new(None),
      cond: Condvar::new(),
    });
    let completion = SubmitCompletion(Some(Arc::clone(&shared)));
    self.push(LoopCommand::Run(Box::new(move |sockets| {
      completion.complete(f(sockets));
    })))?;

    let mut guard = shared.state.lock().unwrap();
    while guard.is_none() {
      guard = shared.cond.wait(guard).unwrap();
    }
    guard.take().unwrap()
  }

  /// Stop the loop and join its thread. Sockets still registered are
  /// released when the loop exits.
  pub fn shutdown(&self) {
    let worker = self.worker.lock().unwrap().take();
    if let Some(mut worker) = worker {
      worker.shutdown();
      worker.join();
    }
  }
}

fn run_loop(mut poll: Poll, receiver: mpsc::Receiver<LoopCommand>, mut sockets: SocketManager) {
  debug!("event loop starting");
  let mut events = Events::with_capacity(128);

  'outer: loop {
    if let Err(e) = poll.poll(&mut events, None) {
      if e.kind() == io::ErrorKind::Interrupted {
        continue;
      }
      error!("event loop poll failed: {e}");
      break;
    }
    for event in events.iter() {
      if event.token() == WAKER_TOKEN {
        loop {
          match receiver.try_recv() {
            Ok(LoopCommand::Stop) => break 'outer,
            Ok(LoopCommand::Send(message)) => sockets.send_message(message),
            Ok(LoopCommand::Run(f)) => {
              // A submitted closure must not take down the loop.
              if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&mut sockets)))
                .is_err()
              {
                error!("submitted closure panicked in event loop");
              }
            }
            Err(_) => break,
          }
        }
      } else {
        sockets.handle_event(event);
      }
    }
  }

  // Complete any queued synchronous submissions with an error instead of
  // leaving their callers blocked.
  while receiver.try_recv().is_ok() {}
  drop(sockets);
  debug!("event loop finished");
}
