use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::core::client::{is_retry, Client};
use crate::core::engine::{Completion, Mailbox, Message};
use crate::errors::PoolError;
use crate::memory::{BufferPool, Checkable, CheckablePool, ObjectPool, Pool, Segment};

/// Pooled receive handle: a leased buffer segment plus the client it reads
/// from.
///
/// While checked out the context owns its segment exclusively; it travels
/// into the I/O task that fills it and comes back inside the completion.
pub struct IoContext<C> {
    segment: Option<Segment>,
    client: Option<Arc<C>>,
    completion: Mailbox<C>,
}

impl<C> IoContext<C> {
    pub(crate) fn new(completion: Mailbox<C>) -> Self {
        Self {
            segment: None,
            client: None,
            completion,
        }
    }

    pub fn bind(&mut self, client: Arc<C>) {
        self.client = Some(client);
    }

    pub fn client(&self) -> Option<&Arc<C>> {
        self.client.as_ref()
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut [u8]> {
        self.segment.as_deref_mut()
    }

    pub fn is_checked_out(&self) -> bool {
        self.segment.is_some()
    }

    /// Post the outcome of a receive back to the engine.
    pub(crate) fn complete(self, result: io::Result<usize>) {
        let mailbox = self.completion.clone();
        let _ = mailbox.send(Message::Completion(Completion::Received { ctx: self, result }));
    }
}

impl<C: Client> IoContext<C> {
    pub(crate) fn try_receive(&mut self) -> io::Result<usize> {
        match (&self.client, &mut self.segment) {
            (Some(client), Some(segment)) => client.connection().try_read(segment),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) async fn receive(&mut self) -> io::Result<usize> {
        match (&self.client, &mut self.segment) {
            (Some(client), Some(segment)) => client.connection().read(segment).await,
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl<C> Checkable for IoContext<C> {
    type Source = BufferPool;

    fn check_out(&mut self, buffers: &mut BufferPool) -> Result<(), PoolError> {
        debug_assert!(self.segment.is_none(), "context checked out twice");
        self.segment = Some(buffers.acquire()?);
        Ok(())
    }

    fn check_in(&mut self, buffers: &mut BufferPool) {
        if let Some(segment) = self.segment.take() {
            buffers.release(segment);
        }
        self.client = None;
    }
}

/// Receive contexts over a buffer arena with one segment per context.
pub type ContextPool<C> = CheckablePool<ObjectPool<IoContext<C>>, IoContext<C>>;

pub(crate) fn context_pool<C>(
    context_count: usize,
    segment_size: usize,
    completion: Mailbox<C>,
) -> Result<ContextPool<C>, PoolError>
where
    C: Send + Sync + 'static,
{
    let buffers = BufferPool::new(context_count, segment_size)?;
    let contexts = ObjectPool::with_initial_size(
        move || Ok(IoContext::new(completion.clone())),
        context_count,
    )?;
    Ok(CheckablePool::new(contexts, buffers))
}

/// One send. Not pooled: the payload belongs to the caller and the handle
/// lives only until the write completes.
pub(crate) struct WriteOp<C> {
    client: Arc<C>,
    data: Bytes,
}

impl<C: Client> WriteOp<C> {
    pub(crate) fn new(client: Arc<C>, data: Bytes) -> Self {
        Self { client, data }
    }

    /// Write as much as possible inline; hand the rest to an I/O task.
    pub(crate) fn start(self, mailbox: &Mailbox<C>) {
        let mut written = 0;
        loop {
            if written == self.data.len() {
                return self.complete(Ok(()), mailbox);
            }
            match self.client.connection().try_write(&self.data[written..]) {
                Ok(0) => return self.complete(Err(io::ErrorKind::WriteZero.into()), mailbox),
                Ok(n) => written += n,
                Err(e) if is_retry(&e) => break,
                Err(e) => return self.complete(Err(e), mailbox),
            }
        }

        let mailbox = mailbox.clone();
        tokio::spawn(async move {
            let result = self
                .client
                .connection()
                .write_all(&self.data[written..])
                .await;
            self.complete(result, &mailbox);
        });
    }

    fn complete(self, result: io::Result<()>, mailbox: &Mailbox<C>) {
        let _ = mailbox.send(Message::Completion(Completion::Written {
            client: self.client,
            data: self.data,
            result,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn checkout_leases_and_checkin_returns_segment() {
        let (mailbox, _inbox) = mpsc::unbounded_channel();
        let mut pool: ContextPool<u64> = context_pool(2, 64, mailbox).unwrap();
        assert_eq!(pool.origin().size(), 2);
        assert_eq!(pool.source().available(), 2);

        let mut ctx = pool.acquire().unwrap();
        assert!(ctx.is_checked_out());
        assert_eq!(ctx.buffer_mut().map(|b| b.len()), Some(64));
        assert_eq!(pool.source().leased(), 1);

        ctx.bind(Arc::new(42));
        assert_eq!(ctx.client().map(|c| **c), Some(42));

        pool.release(ctx);
        assert_eq!(pool.source().leased(), 0);
        assert_eq!(pool.origin().size(), 2);

        let ctx = pool.acquire().unwrap();
        assert!(ctx.client().is_none());
        assert!(ctx.is_checked_out());
    }

    #[test]
    fn overflow_context_hits_arena_capacity() {
        let (mailbox, _inbox) = mpsc::unbounded_channel();
        let mut pool: ContextPool<u64> = context_pool(1, 16, mailbox).unwrap();
        let _held = pool.acquire().unwrap();

        // The context factory still builds a new context, but the arena has
        // no segment left for it.
        assert_eq!(
            pool.acquire().err(),
            Some(PoolError::Capacity { capacity: 1 })
        );
        assert_eq!(pool.origin().size(), 1);
    }

    #[test]
    fn reused_context_gets_fresh_lease() {
        let (mailbox, _inbox) = mpsc::unbounded_channel();
        let mut pool: ContextPool<u64> = context_pool(2, 8, mailbox).unwrap();

        let mut ctx = pool.acquire().unwrap();
        if let Some(buf) = ctx.buffer_mut() {
            buf.fill(0xAB);
        }
        let offset = ctx.segment().map(|s| s.offset());
        pool.release(ctx);
        assert_eq!(pool.source().available(), 2);

        let ctx = pool.acquire().unwrap();
        assert!(ctx.is_checked_out());
        assert_eq!(ctx.segment().map(|s| s.offset()), offset);
    }
}
