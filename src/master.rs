//! The master mailbox and its single consumer loop. Every input source
//! (stdin reader, trace-file reader, the after-dependency manager) hands a
//! command to the mailbox instead of calling the engine directly, so only
//! one thread ever touches the registry's slot allocator at a time for
//! command dispatch.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::lockmgr::{LockId, Tracked};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum MailCmd {
    #[default]
    Free,
    Input(String),
    After,
    Exit,
}

struct MailboxState {
    cmd: MailCmd,
}

/// A one-slot inbox guarded by the master lock. Racing senders never lose a
/// command: if the slot is occupied, a sender broadcasts the condvar (to
/// wake the consumer in case it is waiting on something else) and re-waits
/// rather than overwriting what's there.
pub struct Mailbox {
    state: Tracked<MailboxState>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox {
            state: Tracked::new(LockId::Master, MailboxState { cmd: MailCmd::Free }),
        }
    }

    fn send(&self, cmd: MailCmd) {
        let mut guard = self.state.lock();
        loop {
            if guard.cmd == MailCmd::Free {
                guard.cmd = cmd;
                self.state.notify_one();
                return;
            }
            self.state.notify_all();
            self.state.wait(&mut guard);
        }
    }

    /// Called by an input source (stdin or trace-file reader) once it has a
    /// full command line.
    pub fn send_input(&self, line: String) {
        self.send(MailCmd::Input(line));
    }

    /// Called by the after-dependency manager when a predecessor exits and
    /// at least one waiter became ready, so the master loop wakes up and
    /// drains `after.drain_ready()` instead of waiting out a poll interval.
    pub fn notify_after_ready(&self) {
        self.send(MailCmd::After);
    }

    pub fn send_exit(&self) {
        self.send(MailCmd::Exit);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

/// The master thread's body: pull one command at a time out of the mailbox
/// and dispatch it, until `quit` or `send_exit` ends the loop.
pub fn run_master(mailbox: Arc<Mailbox>, engine: &Engine) {
    loop {
        let cmd = {
            let mut guard = mailbox.state.lock();
            loop {
                if guard.cmd == MailCmd::Free {
                    if mailbox.state.wait_for(&mut guard, Duration::from_millis(200)) {
                        // Timed out with nothing queued: give the
                        // after-dependency manager a chance to report newly
                        // ready waiters even without a mailbox send, since
                        // `notify_after_ready` and a timeout can race.
                        break MailCmd::After;
                    }
                    continue;
                }
                break std::mem::replace(&mut guard.cmd, MailCmd::Free);
            }
        };

        match cmd {
            MailCmd::Free => unreachable!("Free is drained before being returned"),
            MailCmd::Input(line) => {
                if crate::command::is_ignorable_line(&line) {
                    continue;
                }
                match crate::command::Command::parse(&line) {
                    Ok(parsed) => match engine.dispatch(parsed) {
                        Ok(text) if !text.is_empty() => println!("{text}"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(%line, error = %e, "command failed"),
                    },
                    Err(e) => tracing::warn!(%line, error = %e, "could not parse command"),
                }
            }
            MailCmd::After => {
                for wref in engine.after.drain_ready() {
                    if let Err(e) = engine.spawn_worker(wref) {
                        tracing::warn!(?wref, error = %e, "failed to spawn a ready after-waiter");
                    }
                }
            }
            MailCmd::Exit => break,
        }

        if engine.is_shutting_down() {
            break;
        }
    }
}
