//! Scripted in-memory stream for driving readers and sessions without sockets.
use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

use bytes::{Buf, Bytes};
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent},
    BufResult,
};

use crate::{listener::SessionStream, metrics::ConnectionHandle};

enum ReadStep {
    Data(Bytes),
    Error(io::ErrorKind),
    Pending,
}

#[derive(Default)]
struct Written {
    data: Vec<u8>,
    shutdown: bool,
    nodelay: bool,
}

/// Peer side view of a [`MockStream`], usable after the stream was moved away.
#[derive(Clone, Default)]
pub struct WrittenHandle(Rc<RefCell<Written>>);

impl WrittenHandle {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().data.clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow().data).into_owned()
    }

    /// Whether the send side was shut down.
    pub fn is_shutdown(&self) -> bool {
        self.0.borrow().shutdown
    }

    pub fn nodelay(&self) -> bool {
        self.0.borrow().nodelay
    }
}

/// A stream that replays scripted reads and records what is written to it.
///
/// Once the script is exhausted reads report end of stream.
pub struct MockStream {
    handle: ConnectionHandle,
    reads: VecDeque<ReadStep>,
    read_chunk_size: usize,
    write_error: Option<io::ErrorKind>,
    nodelay_error: bool,
    written: WrittenHandle,
}

impl MockStream {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            reads: VecDeque::new(),
            read_chunk_size: usize::MAX,
            write_error: None,
            nodelay_error: false,
            written: WrittenHandle::default(),
        }
    }

    pub fn with_read(mut self, data: impl AsRef<[u8]>) -> Self {
        let data = Bytes::copy_from_slice(data.as_ref());
        self.reads.push_back(ReadStep::Data(data));
        self
    }

    pub fn with_read_error(mut self, kind: io::ErrorKind) -> Self {
        self.reads.push_back(ReadStep::Error(kind));
        self
    }

    /// The next read never completes.
    pub fn with_read_pending(mut self) -> Self {
        self.reads.push_back(ReadStep::Pending);
        self
    }

    /// Cap the number of bytes a single read returns.
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn with_write_error(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    pub fn with_nodelay_error(mut self) -> Self {
        self.nodelay_error = true;
        self
    }

    pub fn written(&self) -> WrittenHandle {
        self.written.clone()
    }
}

impl AsyncReadRent for MockStream {
    async fn read<T: IoBufMut>(&mut self, mut buf: T) -> BufResult<usize, T> {
        loop {
            match self.reads.front_mut() {
                None => return (Ok(0), buf),
                Some(ReadStep::Pending) => {
                    return std::future::pending::<BufResult<usize, T>>().await
                }
                Some(ReadStep::Error(kind)) => {
                    let kind = *kind;
                    self.reads.pop_front();
                    return (Err(kind.into()), buf);
                }
                Some(ReadStep::Data(data)) if data.is_empty() => {
                    self.reads.pop_front();
                }
                Some(ReadStep::Data(data)) => {
                    let n = data.len().min(buf.bytes_total()).min(self.read_chunk_size);
                    unsafe {
                        std::ptr::copy_nonoverlapping(data.as_ptr(), buf.write_ptr(), n);
                        buf.set_init(n);
                    }
                    data.advance(n);
                    return (Ok(n), buf);
                }
            }
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        (Err(io::ErrorKind::Unsupported.into()), buf)
    }
}

impl AsyncWriteRent for MockStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        if let Some(kind) = self.write_error {
            return (Err(kind.into()), buf);
        }
        let data = unsafe { std::slice::from_raw_parts(buf.read_ptr(), buf.bytes_init()) };
        self.written.0.borrow_mut().data.extend_from_slice(data);
        let n = data.len();
        (Ok(n), buf)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        (Err(io::ErrorKind::Unsupported.into()), buf_vec)
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.written.0.borrow_mut().shutdown = true;
        Ok(())
    }
}

impl SessionStream for MockStream {
    fn connection_handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        if self.nodelay_error {
            return Err(io::ErrorKind::Unsupported.into());
        }
        self.written.0.borrow_mut().nodelay = nodelay;
        Ok(())
    }
}
