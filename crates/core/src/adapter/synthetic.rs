use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{AdapterHandle, EventSink, OpenRequest, SourceAdapter};
use crate::error::Result;
use crate::relay::Framing;

/// Generates placeholder SVG frames locally, for demos and for cameras
/// without a reachable source.
pub struct SyntheticAdapter {
    warmup: Duration,
    grace: Duration,
}

impl SyntheticAdapter {
    pub fn new(warmup: Duration, grace: Duration) -> Self {
        Self { warmup, grace }
    }
}

#[async_trait]
impl SourceAdapter for SyntheticAdapter {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn framing(&self) -> Framing {
        Framing::multipart("image/svg+xml")
    }

    async fn open(&self, request: OpenRequest) -> Result<AdapterHandle> {
        let warmup = self.warmup;
        tracing::debug!(stream = %request.id, warmup_ms = warmup.as_millis() as u64, "synthetic source opened");
        Ok(AdapterHandle::spawn(self.grace, move |sink, cancel| {
            generate(request, warmup, sink, cancel)
        }))
    }
}

async fn generate(request: OpenRequest, warmup: Duration, sink: EventSink, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(warmup) => {}
    }
    if !sink.connected().await {
        return;
    }

    let period = Duration::from_secs(1) / request.profile.fps.max(1);
    let mut ticker = tokio::time::interval(period);
    let mut frame = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if !sink.data(render_frame(&request, frame)).await {
            return;
        }
        frame += 1;
    }
}

/// One placeholder frame showing the source, the profile and a counter.
pub(crate) fn render_frame(request: &OpenRequest, frame: u64) -> Bytes {
    let profile = request.profile;
    let (w, h) = (profile.width, profile.height);
    let svg = format!(
        concat!(
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"##,
            r##"<rect width="100%" height="100%" fill="#1b1f24"/>"##,
            r##"<text x="50%" y="45%" fill="#e6edf3" font-family="monospace" font-size="{title}" text-anchor="middle">{name}</text>"##,
            r##"<text x="50%" y="58%" fill="#8b949e" font-family="monospace" font-size="{small}" text-anchor="middle">{quality} {w}x{h} @ {fps}fps</text>"##,
            r##"<text x="50%" y="68%" fill="#8b949e" font-family="monospace" font-size="{small}" text-anchor="middle">frame {frame}{audio}</text>"##,
            "</svg>"
        ),
        w = w,
        h = h,
        title = h / 10,
        small = h / 20,
        name = escape_xml(&request.source_name),
        quality = request.quality,
        fps = profile.fps,
        frame = frame,
        audio = if request.audio { " (audio)" } else { "" },
    );
    Bytes::from(svg)
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
