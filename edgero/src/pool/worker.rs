use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
    task::{Context, Poll},
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use super::Shared;
use crate::{Error, ErrorKind, RawConnection, Result, common::verbose};

/// Pool slot which may contain one connection.
#[derive(Debug)]
pub(crate) struct Holder {
    pub(crate) index: usize,
    pub(crate) conn: Option<RawConnection>,
    /// Pool generation at connect time.
    pub(crate) generation: u64,
}

impl Holder {
    pub(crate) fn new(index: usize) -> Holder {
        Self { index, conn: None, generation: 0 }
    }

    /// Returns `true` if the connection can be handed out as is.
    pub(crate) fn is_fresh(&self, generation: u64) -> bool {
        self.generation == generation && self.conn.as_ref().is_some_and(RawConnection::is_usable)
    }

    pub(crate) fn set_conn(&mut self, conn: RawConnection, generation: u64, shared: &Shared) {
        debug_assert!(self.conn.is_none());
        self.conn = Some(conn);
        self.generation = generation;
        shared.open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn take_conn(&mut self, shared: &Shared) -> Option<RawConnection> {
        let conn = self.conn.take();
        if conn.is_some() {
            shared.open.fetch_sub(1, Ordering::Relaxed);
        }
        conn
    }
}

pub(crate) type AcquireSend = oneshot::Sender<Result<Holder>>;
pub(crate) type AcquireRecv = oneshot::Receiver<Result<Holder>>;
pub(crate) type CloseSend = oneshot::Sender<Vec<Holder>>;
pub(crate) type CloseRecv = oneshot::Receiver<Vec<Holder>>;

enum WorkerMessage {
    Acquire(AcquireSend),
    Release(Holder),
    Close(CloseSend),
    Terminate,
}

pub(crate) fn pool_closing() -> Error {
    Error::new(ErrorKind::Interface, "The pool is closing")
}

pub(crate) fn pool_closed() -> Error {
    Error::new(ErrorKind::Interface, "The pool is closed")
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    send: UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub(crate) fn new(shared: Arc<Shared>, holders: Vec<Holder>) -> (Self, WorkerFuture) {
        let (send, recv) = mpsc::unbounded_channel();
        // the last holder is handed out first
        let stack = holders.iter().map(|h| h.index).collect();
        (
            Self { send },
            WorkerFuture {
                shared,
                holders: holders.into_iter().map(Some).collect(),
                stack,
                queue: VecDeque::new(),
                recv,
                closing: vec![],
                state: PoolState::Open,
                detached: false,
            },
        )
    }

    /// Request a holder, the receiver resolves once one is available.
    ///
    /// The receiver fails if the worker is gone.
    pub(crate) fn acquire(&self) -> AcquireRecv {
        let (tx, rx) = oneshot::channel();
        let _ = self.send.send(WorkerMessage::Acquire(tx));
        rx
    }

    pub(crate) fn release(&self, holder: Holder) {
        // worker gone, the connection is dropped with the holder
        let _ = self.send.send(WorkerMessage::Release(holder));
    }

    /// Request to close, the receiver resolves with every holder once all of them are released.
    pub(crate) fn close(&self) -> CloseRecv {
        let (tx, rx) = oneshot::channel();
        let _ = self.send.send(WorkerMessage::Close(tx));
        rx
    }

    pub(crate) fn terminate(&self) {
        let _ = self.send.send(WorkerMessage::Terminate);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerHandle")
    }
}

enum PoolState {
    Open,
    Closing(Vec<CloseSend>),
    Closed,
}

/// Pool bookkeeping, all holder transitions happen in this task.
pub(crate) struct WorkerFuture {
    shared: Arc<Shared>,

    /// Holder arena, `Some` while the holder is idle in the pool.
    holders: Vec<Option<Holder>>,
    /// Indices of idle holders, the last one is handed out first.
    stack: Vec<usize>,
    queue: VecDeque<AcquireSend>,

    recv: UnboundedReceiver<WorkerMessage>,
    /// Stale or broken connections being shut down.
    closing: Vec<RawConnection>,
    state: PoolState,
    /// Every pool handle is dropped.
    detached: bool,
}

impl WorkerFuture {
    fn acquire(&mut self, send: AcquireSend) {
        match self.state {
            PoolState::Closing(_) => {
                let _ = send.send(Err(pool_closing()));
            }
            PoolState::Closed => {
                let _ = send.send(Err(pool_closed()));
            }
            PoolState::Open => match self.stack.pop().and_then(|i| self.holders[i].take()) {
                Some(holder) => {
                    if let Err(Ok(holder)) = send.send(Ok(holder)) {
                        self.push_idle(holder);
                    }
                }
                None => self.queue.push_back(send),
            },
        }
    }

    fn release(&mut self, mut holder: Holder) {
        let generation = self.shared.generation.load(Ordering::Acquire);

        let keep = matches!(self.state, PoolState::Open | PoolState::Closing(_)) && holder.is_fresh(generation);
        if !keep {
            if let Some(conn) = holder.take_conn(&self.shared) {
                if !conn.is_closed() {
                    self.closing.push(conn);
                }
            }
        }

        if let PoolState::Open = self.state {
            while let Some(send) = self.queue.pop_front() {
                if let Err(Ok(returned)) = send.send(Ok(holder)) {
                    holder = returned;
                    continue;
                }
                return;
            }
        }

        self.push_idle(holder);
        self.check_closed();
    }

    fn push_idle(&mut self, holder: Holder) {
        let index = holder.index;
        self.holders[index] = Some(holder);
        self.stack.push(index);
    }

    fn close(&mut self, send: CloseSend) {
        match &mut self.state {
            PoolState::Open => {
                for send in self.queue.drain(..) {
                    let _ = send.send(Err(pool_closing()));
                }
                self.state = PoolState::Closing(vec![send]);
                self.check_closed();
            }
            PoolState::Closing(sends) => sends.push(send),
            PoolState::Closed => {
                let _ = send.send(vec![]);
            }
        }
    }

    /// Hand every holder to the closer once all of them are released.
    fn check_closed(&mut self) {
        let PoolState::Closing(sends) = &mut self.state else {
            return;
        };
        if self.stack.len() != self.holders.len() {
            return;
        }

        let mut sends = std::mem::take(sends).into_iter();
        let holders = self.holders.iter_mut().filter_map(Option::take).collect::<Vec<_>>();
        self.stack.clear();

        if let Some(send) = sends.next() {
            if let Err(holders) = send.send(holders) {
                // closer gave up, shut the connections down here
                for mut holder in holders {
                    if let Some(conn) = holder.take_conn(&self.shared) {
                        self.closing.push(conn);
                    }
                }
            }
        }
        for send in sends {
            let _ = send.send(vec![]);
        }

        self.state = PoolState::Closed;
    }

    fn terminate(&mut self) {
        for send in self.queue.drain(..) {
            let _ = send.send(Err(pool_closed()));
        }
        if let PoolState::Closing(sends) = &mut self.state {
            for send in sends.drain(..) {
                let _ = send.send(vec![]);
            }
        }
        for holder in self.holders.iter_mut().flatten() {
            // dropping the connection closes the socket
            holder.take_conn(&self.shared);
        }
        self.closing.clear();
        self.state = PoolState::Closed;
    }

    /// Shut down idle connections once every pool handle is dropped.
    fn detach(&mut self) {
        self.detached = true;
        for send in self.queue.drain(..) {
            let _ = send.send(Err(pool_closed()));
        }
        for holder in self.holders.iter_mut().flatten() {
            if let Some(conn) = holder.take_conn(&self.shared) {
                self.closing.push(conn);
            }
        }
    }
}

impl Future for WorkerFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.as_mut().get_mut();

        while !me.detached {
            let Poll::Ready(msg) = me.recv.poll_recv(cx) else {
                break;
            };
            let Some(msg) = msg else {
                me.detach();
                break;
            };

            match msg {
                WorkerMessage::Acquire(send) => me.acquire(send),
                WorkerMessage::Release(holder) => me.release(holder),
                WorkerMessage::Close(send) => me.close(send),
                WorkerMessage::Terminate => me.terminate(),
            }
        }

        me.closing.retain_mut(|conn| match conn.poll_close(cx) {
            Poll::Ready(result) => {
                if let Err(_err) = result {
                    #[cfg(feature = "log")]
                    log::error!("failed to close connection: {_err}");
                }
                false
            }
            Poll::Pending => true,
        });

        me.queue.retain(|send| !send.is_closed());
        me.shared.waiting.store(me.queue.len(), Ordering::Relaxed);

        verbose!(
            idle = me.stack.len(),
            waiting = me.queue.len(),
            closing = me.closing.len(),
            open = me.shared.open.load(Ordering::Relaxed),
            "pool worker"
        );

        if me.detached && me.closing.is_empty() {
            return Poll::Ready(());
        }

        Poll::Pending
    }
}
