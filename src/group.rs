use std::any::Any;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use futures_util::future::CatchUnwind;
use futures_util::future::Shared;
use futures_util::future::WeakShared;
use futures_util::FutureExt;

type PanicPayload = Box<dyn Any + Send + 'static>;

/// The computation future with panic trapping applied, so that a panicking
/// computation still resolves and wakes every joined caller.
///
/// Equivalent to `CatchUnwind::map(trap_panic)`, but as a concrete type: a
/// stored fn pointer whose argument mentions `dyn Any` makes auto-trait
/// checks on the `impl Future` returned by [`Group::execute`] fail with
/// "implementation of `FnOnce` is not general enough"
/// (rust-lang/rust#110338), so the mapping happens in `poll` instead.
struct TrappedFuture<Fut> {
    inner: CatchUnwind<AssertUnwindSafe<Fut>>,
}

impl<Fut: Future> Future for TrappedFuture<Fut> {
    type Output = Result<Fut::Output, CaughtPanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is structurally pinned; it is never moved out of
        // `self`, and `TrappedFuture` is `Unpin` only if `inner` is.
        let inner = unsafe { self.map_unchecked_mut(|this| &mut this.inner) };
        inner.poll(cx).map(trap_panic)
    }
}

type Call<Fut> = Shared<TrappedFuture<Fut>>;
type WeakCall<Fut> = WeakShared<TrappedFuture<Fut>>;

fn trap_panic<T>(result: Result<T, PanicPayload>) -> Result<T, CaughtPanic> {
    result.map_err(CaughtPanic::from_payload)
}

/// A captured panic from a coalesced computation. Cloned to every caller that
/// joined the call, and resumed as a panic in each of them.
#[derive(Clone, Debug, thiserror::Error)]
#[error("coalesced computation panicked: {message}")]
struct CaughtPanic {
    message: Arc<str>,
}

impl CaughtPanic {
    fn from_payload(payload: PanicPayload) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("(non-string panic payload)")
        };
        Self { message }
    }

    fn resume(self) -> ! {
        std::panic::resume_unwind(Box::new(self.to_string()))
    }
}

/// Keeps track of in-flight computations, keyed by the arguments of the
/// computation, and attaches additional callers to an in-flight computation
/// instead of starting a duplicate one.
///
/// A key is present in the group exactly while a computation for it is
/// running; once the computation completes (successfully, with an error value,
/// or by panicking), the key is removed and the next call for it starts fresh.
/// Results are not cached beyond the in-flight window.
pub struct Group<K, Fut: Future> {
    calls: Mutex<WeakCallMap<K, Fut>>,
}

impl<K, Fut> Group<K, Fut>
where
    K: Eq + Hash + Clone,
    Fut: Future,
    Fut::Output: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(WeakCallMap::new()),
        }
    }

    /// Start a new computation for `key` or join a currently-running
    /// computation with the same key.
    ///
    /// If no computation for `key` is currently in flight, `make_future` is
    /// called and the returned future becomes the computation; otherwise
    /// `make_future` is *not* called and this function waits for the existing
    /// computation to finish, returning a clone of its output. Either way,
    /// every caller for the same key observes the identical output of the one
    /// computation that ran.
    ///
    /// The returned flag is `true` if this caller joined a computation that
    /// was already in flight, and `false` for the caller that started it. The
    /// starting caller reports `false` even if others join later.
    ///
    /// `make_future` must not do any slow work synchronously; we call it while
    /// a mutex is locked. The actual work should happen inside the returned
    /// future, so that it starts only once this function's result is awaited.
    ///
    /// If the computation panics, the panic is resumed in every caller that
    /// joined the call, and the key is released so that a subsequent call
    /// starts a fresh computation. No caller is left blocked.
    pub fn execute<'a>(
        &'a self,
        key: &'a K,
        make_future: impl FnOnce() -> Fut,
    ) -> impl Future<Output = (Fut::Output, bool)> + 'a {
        let (call, joined) = {
            // Find an existing call or start a new one.
            let mut calls = self.calls.lock().unwrap();
            if let Some(call) = calls.get(key) {
                (call, true)
            } else {
                let future = TrappedFuture {
                    inner: AssertUnwindSafe(make_future()).catch_unwind(),
                }
                .shared();
                calls.insert(key.clone(), &future);
                (future, false)
            }
        };
        let remover = scopeguard::guard((), move |_| {
            // Make sure that our map doesn't accumulate old entries for calls
            // which have already completed or which have been canceled.
            // With a scopeguard we can handle completion, cancellation and
            // panics alike.
            let mut calls = self.calls.lock().unwrap();
            calls.remove_if_done(key);
        });

        async move {
            // Make sure the `remover` scopeguard is moved into this future.
            let _remover = remover;

            match call.await {
                Ok(output) => (output, joined),
                Err(caught) => caught.resume(),
            }
        }
    }

    /// Drops the in-flight call for `key`, if any.
    ///
    /// Future calls to [`execute`](Self::execute) for this key will start a
    /// fresh computation rather than joining the earlier one. Callers already
    /// joined to the earlier call are unaffected; they still receive its
    /// output.
    pub fn forget<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut calls = self.calls.lock().unwrap();
        calls.remove(key);
    }
}

impl<K, Fut> Default for Group<K, Fut>
where
    K: Eq + Hash + Clone,
    Fut: Future,
    Fut::Output: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, Fut: Future> fmt::Debug for Group<K, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group").finish_non_exhaustive()
    }
}

/// Maps keys to weak handles of in-flight calls. Weak handles mean the map
/// never keeps a call alive on its own; a call lives exactly as long as at
/// least one caller holds on to it.
struct WeakCallMap<K, Fut: Future> {
    map: HashMap<K, WeakCall<Fut>>,
}

impl<K: Eq + Hash, Fut: Future> WeakCallMap<K, Fut> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    fn insert(&mut self, key: K, call: &Call<Fut>) {
        if let Some(weak) = call.downgrade() {
            self.map.insert(key, weak);
        }
    }

    fn get(&mut self, key: &K) -> Option<Call<Fut>> {
        let strong = self.map.get(key)?.upgrade();
        if strong.is_none() {
            self.map.remove(key);
        }
        strong
    }

    fn remove_if_done(&mut self, key: &K) {
        self.get(key);
    }

    fn remove<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key);
    }
}
