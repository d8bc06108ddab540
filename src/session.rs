use crate::error::{HarnessError, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Something that is started once and stopped once.
pub trait Lifecycle: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

type Factory<E> = Box<dyn Fn() -> Result<E> + Send + Sync>;

struct SessionState<E> {
    count: usize,
    instance: Option<Arc<E>>,
}

/// Shares one environment among every borrower. The first [`Session::acquire`]
/// builds and starts it; the release that brings the count back to zero stops
/// it.
pub struct Session<E: Lifecycle> {
    factory: Factory<E>,
    state: Mutex<SessionState<E>>,
}

impl<E: Lifecycle> Session<E> {
    pub fn new(factory: impl Fn() -> Result<E> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            state: Mutex::new(SessionState {
                count: 0,
                instance: None,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState<E>>> {
        self.state
            .lock()
            .map_err(|_| HarnessError::Process("session state lock poisoned".to_string()))
    }

    pub fn acquire(&self) -> Result<Arc<E>> {
        let mut state = self.lock()?;
        if let Some(instance) = state.instance.clone() {
            state.count += 1;
            return Ok(instance);
        }
        // concurrent acquirers wait on the lock until start returns
        let instance = Arc::new((self.factory)()?);
        instance.start()?;
        info!("session environment started");
        state.instance = Some(Arc::clone(&instance));
        state.count = 1;
        Ok(instance)
    }

    pub fn release(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.count == 0 {
            return Err(HarnessError::Misuse(
                "session released more often than acquired".to_string(),
            ));
        }
        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }
        let Some(instance) = state.instance.take() else {
            return Ok(());
        };
        instance.stop()?;
        info!("session environment stopped");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.lock().map(|state| state.count).unwrap_or(0)
    }

    /// Acquires and returns a guard that releases on drop.
    pub fn lease(&self) -> Result<Lease<'_, E>> {
        let instance = self.acquire()?;
        Ok(Lease {
            session: self,
            instance,
            released: false,
        })
    }
}

pub struct Lease<'a, E: Lifecycle> {
    session: &'a Session<E>,
    instance: Arc<E>,
    released: bool,
}

impl<E: Lifecycle> Lease<'_, E> {
    pub fn get(&self) -> &E {
        &self.instance
    }

    /// Releases now, reporting a failed stop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.session.release()
    }
}

impl<E: Lifecycle> std::ops::Deref for Lease<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.instance
    }
}

impl<E: Lifecycle> Drop for Lease<'_, E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.session.release() {
            tracing::error!(error = %err, "releasing session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Counters {
        built: AtomicUsize,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct Env(Arc<Counters>);

    impl Lifecycle for Env {
        fn start(&self) -> Result<()> {
            self.0.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.0.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session() -> (Session<Env>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let shared = Arc::clone(&counters);
        let session = Session::new(move || {
            shared.built.fetch_add(1, Ordering::SeqCst);
            Ok(Env(Arc::clone(&shared)))
        });
        (session, counters)
    }

    #[test]
    fn nested_acquires_start_and_stop_once() {
        let (session, counters) = session();
        for _ in 0..3 {
            session.acquire().unwrap();
        }
        assert_eq!(session.count(), 3);
        for _ in 0..3 {
            session.release().unwrap();
        }
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert!(matches!(session.release(), Err(HarnessError::Misuse(_))));
    }

    #[test]
    fn brackets_after_full_release_start_a_new_environment() {
        let (session, counters) = session();
        session.acquire().unwrap();
        session.release().unwrap();
        session.acquire().unwrap();
        session.release().unwrap();
        assert_eq!(counters.built.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_acquirers_share_one_environment() {
        let (session, counters) = session();
        let session = Arc::new(session);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || session.acquire().map(|_| ()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(session.count(), 8);
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        for _ in 0..8 {
            session.release().unwrap();
        }
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_releases_on_drop() {
        let (session, counters) = session();
        {
            let outer = session.lease().unwrap();
            let inner = session.lease().unwrap();
            inner.release().unwrap();
            assert_eq!(outer.get().0.started.load(Ordering::SeqCst), 1);
        }
        assert_eq!(session.count(), 0);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_start_leaves_session_empty() {
        struct Broken;
        impl Lifecycle for Broken {
            fn start(&self) -> Result<()> {
                Err(HarnessError::Process("up failed".to_string()))
            }
            fn stop(&self) -> Result<()> {
                Ok(())
            }
        }
        let session = Session::new(|| Ok(Broken));
        assert!(session.acquire().is_err());
        assert_eq!(session.count(), 0);
        assert!(matches!(session.release(), Err(HarnessError::Misuse(_))));
    }
}
