//! Utilities for TCP relay
//!
//! The `CopyBuffer` and transfer-state machinery are borrowed from the
//! [tokio](https://github.com/tokio-rs/tokio) project. LICENSE MIT

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::ready;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{self, Instant, Sleep},
};

use super::aead::MAX_PAYLOAD_SIZE;

struct CopyBuffer {
    read_done: bool,
    pos: usize,
    cap: usize,
    amt: u64,
    buf: Box<[u8]>,
}

impl CopyBuffer {
    fn new(buffer_size: usize) -> Self {
        Self {
            read_done: false,
            pos: 0,
            cap: 0,
            amt: 0,
            buf: vec![0; buffer_size].into_boxed_slice(),
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            // If our buffer is empty, then we need to read some data to
            // continue.
            if self.pos == self.cap && !self.read_done {
                let me = &mut *self;
                let mut buf = ReadBuf::new(&mut me.buf);
                ready!(reader.as_mut().poll_read(cx, &mut buf))?;
                let n = buf.filled().len();
                if n == 0 {
                    self.read_done = true;
                } else {
                    self.pos = 0;
                    self.cap = n;
                }
            }

            // If our buffer has some data, let's write it out!
            while self.pos < self.cap {
                let me = &mut *self;
                let i = ready!(writer.as_mut().poll_write(cx, &me.buf[me.pos..me.cap]))?;
                if i == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write zero byte into writer",
                    )));
                } else {
                    self.pos += i;
                    self.amt += i as u64;
                }
            }

            // If we've written all the data and we've seen EOF, flush out the
            // data and finish the transfer.
            if self.pos == self.cap && self.read_done {
                ready!(writer.as_mut().poll_flush(cx))?;
                return Poll::Ready(Ok(self.amt));
            }
        }
    }
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown(u64),
    Done(u64),
}

fn transferred(state: &TransferState) -> u64 {
    match *state {
        TransferState::Running(ref buf) => buf.amt,
        TransferState::ShuttingDown(amt) | TransferState::Done(amt) => amt,
    }
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    mut r: Pin<&mut A>,
    mut w: Pin<&mut B>,
) -> Poll<io::Result<u64>>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    loop {
        match state {
            TransferState::Running(buf) => {
                let count = ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown(count);
            }
            TransferState::ShuttingDown(count) => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done(*count);
            }
            TransferState::Done(count) => return Poll::Ready(Ok(*count)),
        }
    }
}

struct TimeoutState {
    timeout: Option<Duration>,
    cur: Pin<Box<Sleep>>,
    active: bool,
}

impl TimeoutState {
    fn new(timeout: Option<Duration>) -> TimeoutState {
        TimeoutState {
            timeout,
            cur: Box::pin(time::sleep_until(Instant::now())),
            active: false,
        }
    }

    #[inline]
    fn reset(&mut self) {
        if self.active {
            self.active = false;
            self.cur.as_mut().reset(Instant::now());
        }
    }

    #[inline]
    fn clear(&mut self) {
        self.timeout = None;
        self.active = false;
    }

    #[inline]
    fn poll_check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return Ok(()),
        };

        if !self.active {
            self.cur.as_mut().reset(Instant::now() + timeout);
            self.active = true;
        }

        match self.cur.as_mut().poll(cx) {
            Poll::Ready(()) => Err(io::Error::from(io::ErrorKind::TimedOut)),
            Poll::Pending => Ok(()),
        }
    }
}

struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
    timeout: TimeoutState,
    last_transferred: u64,
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<(u64, u64)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let poll_a_to_b = transfer_one_direction(cx, &mut this.a_to_b, Pin::new(&mut *this.a), Pin::new(&mut *this.b))?;
        let poll_b_to_a = transfer_one_direction(cx, &mut this.b_to_a, Pin::new(&mut *this.b), Pin::new(&mut *this.a))?;

        if poll_a_to_b.is_ready() || poll_b_to_a.is_ready() {
            // One direction has completed end-to-end, the session is
            // established; idle handling no longer applies.
            this.timeout.clear();
        } else {
            let total = transferred(&this.a_to_b) + transferred(&this.b_to_a);
            if total > this.last_transferred {
                this.last_transferred = total;
                this.timeout.reset();
            }
            if let Err(err) = this.timeout.poll_check(cx) {
                debug!(
                    "copy bidirection idle timeout, a_to_b: {}, b_to_a: {}",
                    transferred(&this.a_to_b),
                    transferred(&this.b_to_a),
                );
                return Poll::Ready(Err(err));
            }
        }

        // It is not a problem if ready! returns early because
        // transfer_one_direction for the other direction will keep returning
        // TransferState::Done(count) in future calls to poll
        let a_to_b = ready!(poll_a_to_b);
        let b_to_a = ready!(poll_b_to_a);

        trace!("copy bidirection ends, a_to_b: {}, b_to_a: {}", a_to_b, b_to_a);

        Poll::Ready(Ok((a_to_b, b_to_a)))
    }
}

/// Copies data in both directions between `encrypted` and `plain`.
///
/// If an EOF is observed on one stream, `poll_shutdown` is invoked on the
/// other, and the remaining direction keeps running until it finishes too.
///
/// While no direction has completed, `timeout` is applied as an idle
/// deadline: it is refreshed by every transferred byte, and exceeding it
/// fails the relay with `ErrorKind::TimedOut`. Once either direction
/// completes end-to-end the deadline is cleared.
///
/// Returns the bytes copied encrypted-to-plain and plain-to-encrypted, in
/// that order.
pub async fn copy_encrypted_bidirectional<E, P>(
    encrypted: &mut E,
    plain: &mut P,
    timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    E: AsyncRead + AsyncWrite + Unpin + ?Sized,
    P: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    CopyBidirectional {
        a: encrypted,
        b: plain,
        a_to_b: TransferState::Running(CopyBuffer::new(MAX_PAYLOAD_SIZE)),
        b_to_a: TransferState::Running(CopyBuffer::new(MAX_PAYLOAD_SIZE)),
        timeout: TimeoutState::new(timeout),
        last_transferred: 0,
    }
    .await
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn idle_relay_times_out() {
        let (mut a, _a_peer) = tokio::io::duplex(64);
        let (mut b, _b_peer) = tokio::io::duplex(64);

        let err = copy_encrypted_bidirectional(&mut a, &mut b, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn relay_copies_both_directions() {
        let (mut a, mut a_peer) = tokio::io::duplex(1 << 16);
        let (mut b, mut b_peer) = tokio::io::duplex(1 << 16);

        let driver = tokio::spawn(async move {
            a_peer.write_all(b"from a").await.unwrap();
            a_peer.shutdown().await.unwrap();
            b_peer.write_all(b"from b").await.unwrap();
            b_peer.shutdown().await.unwrap();

            let mut from_b = Vec::new();
            a_peer.read_to_end(&mut from_b).await.unwrap();
            let mut from_a = Vec::new();
            b_peer.read_to_end(&mut from_a).await.unwrap();
            (from_a, from_b)
        });

        let (a_to_b, b_to_a) =
            copy_encrypted_bidirectional(&mut a, &mut b, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(a_to_b, 6);
        assert_eq!(b_to_a, 6);

        let (from_a, from_b) = driver.await.unwrap();
        assert_eq!(from_a, b"from a");
        assert_eq!(from_b, b"from b");
    }
}
