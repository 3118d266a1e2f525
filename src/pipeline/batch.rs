//! Fixed-size batching stage.
//!
//! Emits groups of exactly `batch_size` in arrival order, plus one final
//! partial batch at end-of-stream. Conservation holds: every item received
//! appears in exactly one emitted batch. An upstream error is forwarded and
//! ends the stream.

use futures::{Stream, StreamExt};

struct BatchState<S, T> {
    upstream: S,
    buf: Vec<T>,
    done: bool,
    batch_size: usize,
}

/// Wrap a fallible stream into a stream of batches.
pub fn batches<S, T, E>(upstream: S, batch_size: usize) -> impl Stream<Item = Result<Vec<T>, E>>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    assert!(batch_size > 0, "batch_size must be positive");
    let state = BatchState {
        upstream,
        buf: Vec::with_capacity(batch_size),
        done: false,
        batch_size,
    };
    futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            if st.buf.len() == st.batch_size {
                let full = std::mem::replace(&mut st.buf, Vec::with_capacity(st.batch_size));
                return Some((Ok(full), st));
            }
            match st.upstream.next().await {
                Some(Ok(item)) => st.buf.push(item),
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    if st.buf.is_empty() {
                        return None;
                    }
                    let rest = std::mem::take(&mut st.buf);
                    return Some((Ok(rest), st));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_ok<T: Clone>(
        items: Vec<Result<T, ()>>,
        size: usize,
    ) -> Vec<Result<Vec<T>, ()>> {
        batches(futures::stream::iter(items), size).collect().await
    }

    #[tokio::test]
    async fn groups_with_final_partial_batch() {
        let out = collect_ok((0..5).map(Ok).collect::<Vec<Result<i32, ()>>>(), 3).await;
        let out: Vec<Vec<i32>> = out.into_iter().map(|b| b.unwrap()).collect();
        assert_eq!(out, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_tail() {
        let out = collect_ok((0..6).map(Ok).collect::<Vec<Result<i32, ()>>>(), 3).await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn empty_stream_emits_nothing() {
        let out = collect_ok(Vec::<Result<i32, ()>>::new(), 3).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn conservation_across_batches() {
        let n = 1037;
        let out = collect_ok((0..n).map(Ok).collect::<Vec<Result<i32, ()>>>(), 100).await;
        let total: usize = out.iter().map(|b| b.as_ref().unwrap().len()).sum();
        assert_eq!(total, n as usize);
        // arrival order preserved across the whole run
        let flat: Vec<i32> = out.into_iter().flat_map(|b| b.unwrap()).collect();
        assert!(flat.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn upstream_error_ends_the_stream() {
        let items: Vec<Result<i32, ()>> = vec![Ok(1), Ok(2), Err(()), Ok(3)];
        let out = collect_ok(items, 10).await;
        // the error is forwarded and nothing follows it
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }
}
