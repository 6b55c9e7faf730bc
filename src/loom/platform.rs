//! Runtime glue shared by native and wasm targets.

#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub fn spawn<O, F>(future: F) -> tokio::task::JoinHandle<O>
where
    O: Send + 'static,
    F: std::future::Future<Output = O> + Send + 'static,
{
    tokio::spawn(future)
}

#[cfg(target_arch = "wasm32")]
#[inline]
pub fn spawn<F>(future: F)
where
    F: std::future::Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Gives other tasks, the DMA engines among them, a chance to run.
#[cfg(not(target_arch = "wasm32"))]
#[inline]
pub async fn yield_now() {
    tokio::task::yield_now().await
}

#[cfg(target_arch = "wasm32")]
pub async fn yield_now() {
    let mut yielded = false;
    futures::future::poll_fn(|cx| match yielded {
        true => std::task::Poll::Ready(()),
        false => {
            yielded = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    })
    .await
}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxFuture<'a, T> = futures::future::BoxFuture<'a, T>;
#[cfg(target_arch = "wasm32")]
pub type BoxFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;

/// Installs a global subscriber that streams spans to a Tracy client.
#[cfg(feature = "trace")]
pub fn init_tracing() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)
}
