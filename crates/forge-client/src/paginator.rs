//! The async paginator (component C11, §4.11): a lazy page publisher over
//! a token-based list operation.
//!
//! Not grounded in `flow-client::pagination`, which wraps the `page_turner`
//! crate for offset-based pagination with no backpressure story — a
//! mismatch with this engine's continuation-token model. Instead this
//! follows [`forge_stream`]'s own publisher shape (`futures::stream::unfold`
//! driving state forward one item at a time), the sibling-crate idiom
//! closest to what §4.11 actually describes. See DESIGN.md.

use std::sync::Arc;

use forge_error::{ErrorKind, RuntimeError};
use futures::stream::{self, Stream};

/// Fetches one page given the input and an optional continuation token,
/// returning the page plus the token to request the next one (`None` means
/// this was the last page).
#[async_trait::async_trait]
pub trait PageFetcher<I, P>: Send + Sync {
    async fn fetch_page(&self, input: &I, continuation_token: Option<&str>) -> Result<(P, Option<String>), RuntimeError>;
}

/// A single page of results, generic enough for the paginator to count and
/// flatten items without knowing the concrete output shape.
pub trait Page: Send {
    type Item: Send;
    fn item_count(&self) -> usize;
    fn into_items(self) -> Vec<Self::Item>;
}

struct PaginatorState<I, P> {
    fetcher: Arc<dyn PageFetcher<I, P>>,
    input: I,
    next_token: Option<String>,
    previous_token: Option<String>,
    items_emitted: usize,
    max_items: Option<usize>,
    done: bool,
}

/// Drives repeated calls to a [`PageFetcher`], capping total items at
/// `max_items` and terminating when the continuation token comes back
/// absent or identical to the one just used (a defensive guard against a
/// misbehaving service that loops on the same token forever).
pub struct Paginator<I, P> {
    fetcher: Arc<dyn PageFetcher<I, P>>,
    input: I,
    max_items: Option<usize>,
}

impl<I, P> Paginator<I, P>
where
    I: Clone + Send + Sync + 'static,
    P: Page + Send + 'static,
{
    pub fn new(fetcher: Arc<dyn PageFetcher<I, P>>, input: I) -> Self {
        Paginator { fetcher, input, max_items: None }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// The lazy stream of pages. Each poll fetches exactly one page; no
    /// page is requested before the previous one has been consumed.
    pub fn pages(self) -> impl Stream<Item = Result<P, RuntimeError>> {
        let state = PaginatorState {
            fetcher: self.fetcher,
            input: self.input,
            next_token: None,
            previous_token: None,
            items_emitted: 0,
            max_items: self.max_items,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if let Some(max) = state.max_items {
                if state.items_emitted >= max {
                    return None;
                }
            }

            let result = state
                .fetcher
                .fetch_page(&state.input, state.next_token.as_deref())
                .await;

            match result {
                Ok((page, next_token)) => {
                    state.items_emitted += page.item_count();
                    let repeats_previous_token =
                        next_token.is_some() && next_token == state.previous_token;
                    state.previous_token = state.next_token.take();
                    state.next_token = next_token;
                    state.done = state.next_token.is_none() || repeats_previous_token;
                    Some((Ok(page), state))
                }
                Err(err) => {
                    state.done = true;
                    Some((Err(err), state))
                }
            }
        })
    }

    /// Convenience wrapper flattening every page's items under `max_items`,
    /// invoking `f` once per item in page order. Stops and propagates on
    /// the first fetch error or the first `Err` returned by `f`.
    pub async fn for_each_item<F>(self, mut f: F) -> Result<(), RuntimeError>
    where
        F: FnMut(P::Item) -> Result<(), RuntimeError> + Send,
    {
        use futures::StreamExt;

        let max_items = self.max_items;
        let mut emitted = 0usize;
        let mut pages = Box::pin(self.pages());

        while let Some(page_result) = pages.next().await {
            let page = page_result?;
            for item in page.into_items() {
                if let Some(max) = max_items {
                    if emitted >= max {
                        return Ok(());
                    }
                }
                f(item)?;
                emitted += 1;
            }
        }
        Ok(())
    }

    /// Convenience wrapper iterating whole pages rather than flattened
    /// items: `f` returns `Ok(true)` to continue, `Ok(false)` to cancel
    /// early without error, matching §4.11's continue-or-cancel predicate
    /// form for callers who want page-level batching instead of per-item
    /// demand.
    pub async fn for_each_page<F>(self, mut f: F) -> Result<(), RuntimeError>
    where
        F: FnMut(P) -> Result<bool, RuntimeError> + Send,
    {
        use futures::StreamExt;

        let mut pages = Box::pin(self.pages());
        while let Some(page_result) = pages.next().await {
            if !f(page_result?)? {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl<T> Page for Vec<T>
where
    T: Send,
{
    type Item = T;

    fn item_count(&self) -> usize {
        self.len()
    }

    fn into_items(self) -> Vec<T> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CountingFetcher {
        pages: Vec<(Vec<u32>, Option<String>)>,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl PageFetcher<(), Vec<u32>> for CountingFetcher {
        async fn fetch_page(&self, _input: &(), continuation_token: Option<&str>) -> Result<(Vec<u32>, Option<String>), RuntimeError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            assert_eq!(
                continuation_token,
                if idx == 0 { None } else { self.pages[idx - 1].1.as_deref() }
            );
            self.pages.get(idx).cloned().ok_or_else(|| {
                RuntimeError::new(ErrorKind::CallValidation, "fetched past the last page")
            })
        }
    }

    #[tokio::test]
    async fn stops_when_the_continuation_token_is_absent() {
        let fetcher = Arc::new(CountingFetcher {
            pages: vec![
                (vec![1, 2], Some("t1".into())),
                (vec![3], None),
            ],
            calls: AtomicU32::new(0),
        });

        let paginator = Paginator::new(fetcher, ());
        let pages: Vec<_> = paginator.pages().collect().await;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].as_ref().unwrap(), &vec![1, 2]);
        assert_eq!(pages[1].as_ref().unwrap(), &vec![3]);
    }

    #[tokio::test]
    async fn stops_when_the_continuation_token_repeats() {
        let fetcher = Arc::new(CountingFetcher {
            pages: vec![
                (vec![1], Some("same".into())),
                (vec![2], Some("same".into())),
            ],
            calls: AtomicU32::new(0),
        });

        let paginator = Paginator::new(fetcher, ());
        let pages: Vec<_> = paginator.pages().collect().await;
        assert_eq!(pages.len(), 2, "the repeated-token page is still yielded, just not followed");
    }

    #[tokio::test]
    async fn for_each_item_respects_max_items_cap() {
        let fetcher = Arc::new(CountingFetcher {
            pages: vec![
                (vec![1, 2, 3], Some("t1".into())),
                (vec![4, 5], None),
            ],
            calls: AtomicU32::new(0),
        });

        let seen = Mutex::new(Vec::new());
        Paginator::new(fetcher, ())
            .with_max_items(4)
            .for_each_item(|item| {
                seen.lock().unwrap().push(item);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn for_each_page_cancels_early_when_the_predicate_returns_false() {
        let fetcher = Arc::new(CountingFetcher {
            pages: vec![
                (vec![1, 2], Some("t1".into())),
                (vec![3, 4], None),
            ],
            calls: AtomicU32::new(0),
        });

        let mut seen_pages = 0usize;
        Paginator::new(fetcher, ())
            .for_each_page(|page| {
                seen_pages += 1;
                Ok(page.first() != Some(&3))
            })
            .await
            .unwrap();

        assert_eq!(seen_pages, 2, "the page containing 3 is visited, then cancels before a third fetch");
    }
}
