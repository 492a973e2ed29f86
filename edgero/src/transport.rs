//! The [`Transport`] trait.
use std::{
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    Result,
    protocol::{BackendProtocol, FrontendProtocol},
};

/// A buffered stream which can send and receive EdgeDB message.
pub trait Transport: Unpin {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// Implementor should handle `LogMessage` and `ParameterStatus` and should not return it.
    ///
    /// Implementor also should handle `ErrorResponse` and return it as [`Err`] once the
    /// following `ReadyForCommand` is received.
    ///
    /// [1]: Transport::poll_flush
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Request implementor to ignore all backend messages until `ReadyForCommand` is received.
    fn ready_request(&mut self);

    /// Send message to the server.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: Transport::poll_flush
    /// [2]: TransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: &F) -> Result<()>;
}

impl<P> Transport for &mut P where P: Transport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn ready_request(&mut self) {
        P::ready_request(self);
    }

    fn send<F: FrontendProtocol>(&mut self, message: &F) -> Result<()> {
        P::send(self, message)
    }
}

/// An extension trait to provide `Future` API for [`Transport`].
pub trait TransportExt: Transport {
    /// Flush the underlying io.
    fn flush(&mut self) -> Flush<'_, Self> {
        Flush { io: self }
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> Recv<'_, Self, B> {
        Recv { io: self, _p: PhantomData }
    }
}

impl<T> TransportExt for T where T: Transport { }

/// Future returned from [`TransportExt::flush`].
#[derive(Debug)]
pub struct Flush<'a, T: ?Sized> {
    io: &'a mut T,
}

impl<T: Transport + ?Sized> Future for Flush<'_, T> {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.io.poll_flush(cx)
    }
}

/// Future returned from [`TransportExt::recv`].
#[derive(Debug)]
pub struct Recv<'a, T: ?Sized, B> {
    io: &'a mut T,
    _p: PhantomData<fn() -> B>,
}

impl<T: Transport + ?Sized, B: BackendProtocol> Future for Recv<'_, T, B> {
    type Output = Result<B>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.io.poll_recv(cx)
    }
}
