//! Streamed-response reassembly.
//!
//! A provider driver yields [`DeltaContent`] fragments in arrival
//! order; indices identify content blocks but are not contiguous or
//! arrival-ordered. [`DeltaAggregator`] buffers per index, emits a
//! live chunk event per fragment for low-latency consumers, and
//! finalizes one [`Message`] with content sorted by index.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{Stream, StreamExt, pin_mut};
use tracing::warn;

use crate::event::{ChunkPayload, CycleEvent, EventBus};
use crate::message::{ContentBlock, DeltaContent, DeltaPayload, Message, Usage};

/// Single-consumer reassembler for one response stream.
pub struct DeltaAggregator {
    bus: Arc<EventBus>,
}

impl Default for DeltaAggregator {
    fn default() -> Self {
        Self {
            bus: EventBus::global(),
        }
    }
}

impl DeltaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    /// Consumes the stream to exhaustion and finalizes one assistant
    /// message. Usage totals accumulate additively; absent counts add
    /// zero.
    pub async fn collect<S>(&self, stream: S) -> Message
    where
        S: Stream<Item = DeltaContent>,
    {
        let mut blocks: BTreeMap<u32, Vec<DeltaPayload>> = BTreeMap::new();
        let mut announced: BTreeMap<u32, bool> = BTreeMap::new();
        let mut usage = Usage::default();

        pin_mut!(stream);
        while let Some(delta) = stream.next().await {
            if let Some(increment) = delta.usage {
                usage += increment;
            }
            self.emit_chunk(&delta, &mut announced);
            blocks.entry(delta.index).or_default().push(delta.payload);
        }

        let content = blocks
            .into_iter()
            .map(|(index, payloads)| finalize_block(index, payloads))
            .collect();

        let mut message = Message::assistant(content);
        message.usage = usage;
        message
    }

    fn emit_chunk(&self, delta: &DeltaContent, announced: &mut BTreeMap<u32, bool>) {
        let payload = match &delta.payload {
            DeltaPayload::Text { text } => ChunkPayload::Text { text: text.clone() },
            DeltaPayload::ActionCall {
                tag,
                name,
                path,
                partial_input,
            } => {
                // Identity fields go out once, on the first delta that
                // carries them; later chunks only relay new input.
                let already_announced = announced.get(&delta.index).copied().unwrap_or(false);
                let identity = !already_announced && (tag.is_some() || name.is_some());
                if identity {
                    announced.insert(delta.index, true);
                }
                if !identity && partial_input.is_none() {
                    return;
                }
                ChunkPayload::ActionCall {
                    tag: identity.then(|| tag.clone()).flatten(),
                    name: identity.then(|| name.clone()).flatten(),
                    path: identity.then(|| path.clone()).flatten(),
                    partial_input: partial_input.clone(),
                }
            }
        };
        self.bus.publish(&CycleEvent::Chunk {
            index: delta.index,
            payload,
        });
    }
}

/// Collapses one index's fragments, in arrival order, into a content
/// block. Homogeneous text concatenates; homogeneous call fragments
/// reconstruct the full JSON input string with identity taken from the
/// first delta that carried it. A mixed index degrades to a call and
/// drops the stray text.
fn finalize_block(index: u32, payloads: Vec<DeltaPayload>) -> ContentBlock {
    let all_text = payloads
        .iter()
        .all(|payload| matches!(payload, DeltaPayload::Text { .. }));

    if all_text {
        let text = payloads
            .into_iter()
            .map(|payload| match payload {
                DeltaPayload::Text { text } => text,
                DeltaPayload::ActionCall { .. } => unreachable!(),
            })
            .collect();
        return ContentBlock::Text { text };
    }

    let mixed = payloads
        .iter()
        .any(|payload| matches!(payload, DeltaPayload::Text { .. }));
    if mixed {
        warn!(index, "index carries both text and call deltas, dropping text");
    }

    let mut tag = None;
    let mut name = None;
    let mut path = None;
    let mut input = String::new();
    for payload in payloads {
        let DeltaPayload::ActionCall {
            tag: delta_tag,
            name: delta_name,
            path: delta_path,
            partial_input,
        } = payload
        else {
            continue;
        };
        if tag.is_none() {
            tag = delta_tag;
        }
        if name.is_none() {
            name = delta_name;
        }
        if path.is_none() {
            path = delta_path;
        }
        if let Some(fragment) = partial_input {
            input.push_str(&fragment);
        }
    }

    ContentBlock::ActionCall {
        tag: tag.unwrap_or_default(),
        name: name.unwrap_or_default(),
        path,
        input,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::stream;

    use super::*;
    use crate::event::EventListener;

    struct ChunkRecorder {
        chunks: Mutex<Vec<(u32, ChunkPayload)>>,
    }

    impl ChunkRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventListener for ChunkRecorder {
        fn handle(&self, event: &CycleEvent) {
            if let CycleEvent::Chunk { index, payload } = event {
                self.chunks.lock().unwrap().push((*index, payload.clone()));
            }
        }
    }

    fn isolated_aggregator() -> (DeltaAggregator, Arc<ChunkRecorder>) {
        let bus = Arc::new(EventBus::new());
        let recorder = ChunkRecorder::new();
        bus.add_listener(recorder.clone());
        (DeltaAggregator::with_bus(bus), recorder)
    }

    #[tokio::test]
    async fn interleaved_text_and_call_deltas_finalize() {
        let (aggregator, _recorder) = isolated_aggregator();
        let deltas = vec![
            DeltaContent::text(0, "Hel"),
            DeltaContent::action_call(1, Some("a1"), Some("Calc"), Some("add"), Some("{\"x\":")),
            DeltaContent::text(0, "lo"),
            DeltaContent::action_call(1, None, None, None, Some("1}")),
        ];

        let message = aggregator.collect(stream::iter(deltas)).await;

        assert_eq!(
            message.content,
            vec![
                ContentBlock::Text {
                    text: "Hello".to_string(),
                },
                ContentBlock::ActionCall {
                    tag: "a1".to_string(),
                    name: "Calc".to_string(),
                    path: Some("add".to_string()),
                    input: "{\"x\":1}".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn content_order_is_index_ascending_regardless_of_arrival() {
        let (aggregator, _recorder) = isolated_aggregator();
        let deltas = vec![
            DeltaContent::text(5, "last"),
            DeltaContent::text(0, "first"),
            DeltaContent::text(2, "mid"),
        ];

        let message = aggregator.collect(stream::iter(deltas)).await;

        let texts: Vec<_> = message
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
                ContentBlock::ActionCall { .. } => panic!("unexpected call"),
            })
            .collect();
        assert_eq!(texts, vec!["first", "mid", "last"]);
    }

    #[tokio::test]
    async fn usage_accumulates_across_deltas() {
        let (aggregator, _recorder) = isolated_aggregator();
        let deltas = vec![
            DeltaContent::text(0, "a").with_usage(Usage {
                input_tokens: 12,
                output_tokens: 1,
            }),
            DeltaContent::text(0, "b"),
            DeltaContent::text(0, "c").with_usage(Usage {
                input_tokens: 0,
                output_tokens: 4,
            }),
        ];

        let message = aggregator.collect(stream::iter(deltas)).await;
        assert_eq!(
            message.usage,
            Usage {
                input_tokens: 12,
                output_tokens: 5,
            }
        );
    }

    #[tokio::test]
    async fn text_deltas_emit_live_chunk_events() {
        let (aggregator, recorder) = isolated_aggregator();
        let deltas = vec![DeltaContent::text(0, "Hel"), DeltaContent::text(0, "lo")];

        aggregator.collect(stream::iter(deltas)).await;

        let chunks = recorder.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].1,
            ChunkPayload::Text {
                text: "Hel".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn call_identity_is_announced_once() {
        let (aggregator, recorder) = isolated_aggregator();
        let deltas = vec![
            DeltaContent::action_call(0, Some("a1"), Some("Calc"), Some("add"), None),
            DeltaContent::action_call(0, Some("a1"), Some("Calc"), None, Some("{}")),
        ];

        aggregator.collect(stream::iter(deltas)).await;

        let chunks = recorder.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].1,
            ChunkPayload::ActionCall {
                tag: Some("a1".to_string()),
                name: Some("Calc".to_string()),
                path: Some("add".to_string()),
                partial_input: None,
            }
        );
        // Second chunk relays only the new input fragment.
        assert_eq!(
            chunks[1].1,
            ChunkPayload::ActionCall {
                tag: None,
                name: None,
                path: None,
                partial_input: Some("{}".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn mixed_index_finalizes_as_a_call() {
        let (aggregator, _recorder) = isolated_aggregator();
        let deltas = vec![
            DeltaContent::action_call(0, Some("a1"), Some("Calc"), None, Some("{}")),
            DeltaContent::text(0, "stray"),
        ];

        let message = aggregator.collect(stream::iter(deltas)).await;
        assert!(matches!(
            &message.content[0],
            ContentBlock::ActionCall { tag, .. } if tag == "a1"
        ));
    }

    #[tokio::test]
    async fn empty_stream_finalizes_an_empty_message() {
        let (aggregator, recorder) = isolated_aggregator();
        let message = aggregator.collect(stream::iter(Vec::new())).await;
        assert!(message.content.is_empty());
        assert_eq!(message.usage, Usage::default());
        assert!(recorder.chunks.lock().unwrap().is_empty());
    }
}
