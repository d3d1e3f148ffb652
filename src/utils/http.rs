use futures_util::StreamExt;

/// Reads at most `max_bytes` of a response body as lossy UTF-8.
///
/// Read errors end the body early instead of failing: the caller already
/// has a non-success status and only wants the text for diagnostics.
pub(crate) async fn response_text_truncated(response: reqwest::Response, max_bytes: usize) -> String {
    let limit = max_bytes.max(1);
    let mut buf = Vec::<u8>::with_capacity(limit.min(8 * 1024));
    let mut truncated = false;

    let mut chunks = response.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = limit - buf.len();
        if chunk.len() > room {
            buf.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        buf.extend_from_slice(&chunk);
        if buf.len() == limit {
            break;
        }
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str("...(truncated)");
    }
    text
}
