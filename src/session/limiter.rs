use super::*;

/// Bounds the number of sessions open at once on one connection.
///
/// Each [`Session`] holds one permit for its whole life and gives it back when
/// dropped, so capacity is returned on every exit path. Waiters are served in
/// the order they started waiting.
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    permits: Arc<Semaphore>,
    open: Arc<AtomicUsize>,
    bound: usize,
}

/// A command-execution channel holding one unit of its connection's capacity.
pub struct Session<T> {
    channel: T,
    _slot: SessionSlot,
}

struct SessionSlot {
    open: Arc<AtomicUsize>,
    bound: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SessionSlot {
    // Runs before `_permit` is dropped, so the counter is back down before a
    // waiter can take the freed slot.
    fn drop(&mut self) {
        let open = self.open.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!("Session released ({open}/{} open)", self.bound);
    }
}

impl<T> Session<T> {
    pub fn channel(&mut self) -> &mut T {
        &mut self.channel
    }
}

impl SessionLimiter {
    /// Creates a limiter allowing `bound` concurrent sessions (at least one).
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            permits: Arc::new(Semaphore::new(bound)),
            open: Arc::new(AtomicUsize::new(0)),
            bound,
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// Sessions currently open through this limiter.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Waits for a free slot, then opens a channel on `connection`.
    ///
    /// If the channel cannot be opened the slot is handed back before the
    /// error is returned.
    pub async fn acquire<C: RemoteConnection>(
        &self,
        connection: &C,
    ) -> Result<Session<C::Channel>, RemoteError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::ConnectClosedError)?;

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| RemoteError::SessionOpen(Box::new(e)))?;

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Session acquired ({open}/{} open)", self.bound);

        Ok(Session {
            channel,
            _slot: SessionSlot {
                open: self.open.clone(),
                bound: self.bound,
                _permit: permit,
            },
        })
    }

    /// Gives a session's slot back.
    pub fn release<T>(&self, session: Session<T>) {
        drop(session);
    }

    /// Refuses all further acquisitions, including those already waiting.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
