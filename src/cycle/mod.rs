//! The execution cycle: parsed turn → resolved actions → concurrent
//! execution → composite artifact.
//!
//! A [`Subtask`] is one round of the reasoning loop. [`CycleRunner`]
//! wires the stages together: aggregate (for streamed turns), parse,
//! validate, execute. Every stage returns a value; a caller always
//! receives a terminal artifact, never an unrecovered failure.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{FutureExt, Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::action::{Action, ERROR_ACTION};
use crate::artifact::{Artifact, NamedArtifact};
use crate::event::{ActionHeader, CycleEvent, EventBus};
use crate::message::{ContentBlock, DeltaContent, Message, ModelOutput, ModelProducer};
use crate::parse::parse_turn;
use crate::retry::RetryPolicy;
use crate::tools::ToolRegistry;

static NEXT_SUBTASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one execution cycle. Parent/child ids
/// form the DAG of a multi-step reasoning chain.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SubtaskId(u64);

impl SubtaskId {
    pub fn next() -> Self {
        Self(NEXT_SUBTASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subtask-{}", self.0)
    }
}

/// One execution cycle: the turn that produced it, the actions it
/// proposed, and the artifact it resolved to.
#[derive(Clone, Debug)]
pub struct Subtask {
    pub id: SubtaskId,
    pub parent: Option<SubtaskId>,
    pub children: Vec<SubtaskId>,
    pub input: Artifact,
    pub thought: Option<String>,
    pub actions: Vec<Action>,
    pub output: Option<Artifact>,
}

impl Subtask {
    pub fn new(input: Artifact, parent: Option<SubtaskId>) -> Self {
        Self {
            id: SubtaskId::next(),
            parent,
            children: Vec::new(),
            input,
            thought: None,
            actions: Vec::new(),
            output: None,
        }
    }

    pub fn add_child(&mut self, child: SubtaskId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// The artifact this cycle resolved to; an empty text artifact if
    /// the cycle has not run.
    pub fn output_or_empty(&self) -> Artifact {
        self.output.clone().unwrap_or_else(|| Artifact::text(""))
    }

    fn headers(&self) -> Vec<ActionHeader> {
        self.actions
            .iter()
            .map(|action| ActionHeader {
                tag: action.tag.clone(),
                name: action.name.clone(),
                path: action.path.clone(),
            })
            .collect()
    }
}

/// What a capability handler sees of the cycle invoking it.
#[derive(Clone, Debug)]
pub struct CycleContext {
    pub subtask: SubtaskId,
    pub parent: Option<SubtaskId>,
    pub input: Artifact,
}

impl CycleContext {
    fn for_subtask(subtask: &Subtask) -> Self {
        Self {
            subtask: subtask.id,
            parent: subtask.parent,
            input: subtask.input.clone(),
        }
    }

    /// A context bound to no cycle, for invoking a capability directly.
    pub fn detached() -> Self {
        Self {
            subtask: SubtaskId::next(),
            parent: None,
            input: Artifact::text(""),
        }
    }
}

/// Resolves each non-error action against the registry and validates
/// its input against the capability schema.
///
/// Resolution failure is not fatal: the action is left as-is and the
/// execution stage converts it to an inline error artifact. A schema
/// violation appends one scoped synthetic error action; the original
/// action stays in the list and still runs (per-action fail-soft, in
/// contrast to the parser's array-level fail-fast).
pub fn validate_actions(actions: &mut Vec<Action>, registry: &dyn ToolRegistry) {
    let mut appended = Vec::new();
    for action in actions.iter_mut() {
        if action.is_error() {
            continue;
        }
        let Some(tool) = registry.find_tool(&action.name) else {
            continue;
        };
        action.tool = Some(tool.clone());

        if action.input.is_empty() {
            continue;
        }
        let Some(path) = action.path.as_deref() else {
            continue;
        };
        if tool.schema_for(path).is_none() {
            // Unknown capability surfaces at execution time.
            continue;
        }
        if let Err(violation) = tool.validate_input(path, &action.input) {
            warn!(tag = %action.tag, %violation, "action input failed schema validation");
            appended.push(Action::scoped_error(&action.tag, violation.to_string()));
        }
    }
    actions.extend(appended);
}

/// Runs a subtask's validated actions and aggregates their outputs.
///
/// State machine: received → (short-circuit | executing) → aggregated.
/// There is no per-action timeout: one hung tool call stalls the whole
/// cycle, and cancellation belongs to the tool-invocation collaborator.
#[derive(Clone)]
pub struct ActionExecutor {
    bus: Arc<EventBus>,
    concurrency: usize,
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self {
            bus: EventBus::global(),
            concurrency: 8,
        }
    }
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            concurrency: 8,
        }
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Executes the subtask's actions and stores the composite output.
    /// Always produces an artifact; start and finish events bracket the
    /// attempt regardless of outcome.
    pub async fn execute(&self, subtask: &mut Subtask) -> Artifact {
        self.bus.publish(&CycleEvent::SubtaskStart {
            subtask: subtask.id,
            parent: subtask.parent,
            thought: subtask.thought.clone(),
            actions: subtask.headers(),
        });

        let output = self.run_actions(subtask).await;
        subtask.output = Some(output.clone());

        self.bus.publish(&CycleEvent::SubtaskFinish {
            subtask: subtask.id,
            parent: subtask.parent,
            thought: subtask.thought.clone(),
            actions: subtask.headers(),
            is_error: output.is_error(),
        });
        output
    }

    async fn run_actions(&self, subtask: &mut Subtask) -> Artifact {
        // A turn-level synthetic error (malformed actions array)
        // suppresses every sibling call for this cycle.
        let turn_errors: Vec<&str> = subtask
            .actions
            .iter()
            .filter(|action| action.is_error() && action.tag == ERROR_ACTION)
            .filter_map(Action::error_message)
            .collect();
        if !turn_errors.is_empty() {
            let joined = turn_errors.join("; ");
            warn!(subtask = %subtask.id, "cycle short-circuited: {joined}");
            return Artifact::error(joined);
        }

        debug!(
            subtask = %subtask.id,
            actions = subtask.actions.len(),
            "executing actions"
        );

        let ctx = CycleContext::for_subtask(subtask);
        let results: Vec<Artifact> = stream::iter(subtask.actions.iter().cloned())
            .map(|action| {
                let ctx = ctx.clone();
                async move {
                    match std::panic::AssertUnwindSafe(run_one(&action, ctx))
                        .catch_unwind()
                        .await
                    {
                        Ok(artifact) => artifact,
                        Err(_) => {
                            error!(tag = %action.tag, "tool invocation panicked");
                            Artifact::error(format!(
                                "tool invocation for '{}' panicked",
                                action.tag
                            ))
                        }
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut blocks = Vec::with_capacity(results.len());
        for (action, result) in subtask.actions.iter_mut().zip(results) {
            action.output = Some(result.clone());
            blocks.push(NamedArtifact::new(format!("{} output", action.tag), result));
        }
        Artifact::composite(blocks)
    }
}

/// Runs one action in isolation. Missing tool, missing path, and
/// handler failure all become inline error artifacts scoped to this
/// action; siblings are unaffected.
async fn run_one(action: &Action, ctx: CycleContext) -> Artifact {
    if action.is_error() {
        return Artifact::error(
            action
                .error_message()
                .unwrap_or("unspecified action error")
                .to_string(),
        );
    }

    let Some(tool) = action.tool.clone() else {
        return Artifact::error(format!("unknown tool '{}'", action.name));
    };
    let Some(path) = action.path.clone() else {
        return Artifact::error(format!(
            "action '{}' names no capability of tool '{}'",
            action.tag, action.name
        ));
    };

    match tool.invoke(&path, action.input.clone(), ctx).await {
        Ok(artifact) => artifact,
        Err(failure) => {
            error!(tag = %action.tag, %failure, "tool invocation failed");
            Artifact::error(failure.to_string())
        }
    }
}

/// Wires one full cycle: (aggregate →) parse → validate → execute.
#[derive(Clone)]
pub struct CycleRunner {
    registry: Arc<dyn ToolRegistry>,
    bus: Arc<EventBus>,
    executor: ActionExecutor,
}

impl CycleRunner {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        let bus = EventBus::global();
        Self {
            registry,
            executor: ActionExecutor::with_bus(bus.clone()),
            bus,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.executor = ActionExecutor {
            bus: bus.clone(),
            concurrency: self.executor.concurrency,
        };
        self.bus = bus;
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.executor = self.executor.concurrency(limit);
        self
    }

    /// Runs one cycle over a complete free-text turn.
    pub async fn run_text(&self, text: &str, parent: Option<SubtaskId>) -> Subtask {
        self.run_cycle(text, Vec::new(), parent).await
    }

    /// Runs one cycle over a finalized message. ActionCall content
    /// blocks are action proposals in their own right and run ahead of
    /// any text-protocol actions found in the message text.
    pub async fn run_message(&self, message: &Message, parent: Option<SubtaskId>) -> Subtask {
        let mut block_actions = Vec::new();
        for block in &message.content {
            if let ContentBlock::ActionCall {
                tag,
                name,
                path,
                input,
            } = block
            {
                block_actions.push(action_from_call(tag, name, path.as_deref(), input));
            }
        }
        self.run_cycle(&message.text(), block_actions, parent).await
    }

    /// Aggregates a delta stream into a message, then runs a cycle
    /// over it.
    pub async fn run_deltas<S>(&self, deltas: S, parent: Option<SubtaskId>) -> Subtask
    where
        S: Stream<Item = DeltaContent> + Send,
    {
        let message = crate::aggregate::DeltaAggregator::with_bus(self.bus.clone())
            .collect(deltas)
            .await;
        self.run_message(&message, parent).await
    }

    /// Runs one cycle over whatever shape the driver produced.
    pub async fn run_output(&self, output: ModelOutput, parent: Option<SubtaskId>) -> Subtask {
        match output {
            ModelOutput::Complete(message) => self.run_message(&message, parent).await,
            ModelOutput::Streamed(deltas) => self.run_deltas(deltas, parent).await,
        }
    }

    /// Requests a turn from the producer under the given retry policy,
    /// then runs a cycle over it.
    ///
    /// Retry exhaustion is the one failure allowed past this core: the
    /// producer's final error propagates to the caller unwrapped.
    /// Terminal rejections skip retrying entirely.
    pub async fn run_producer(
        &self,
        producer: &dyn ModelProducer,
        prompt: &str,
        retry: &RetryPolicy,
        parent: Option<SubtaskId>,
    ) -> Result<Subtask, crate::error::ProducerError> {
        let output = retry
            .run_with(
                || producer.produce(prompt),
                crate::error::ProducerError::is_terminal,
                |attempt| {
                    warn!(
                        attempt = attempt.number,
                        max_attempts = attempt.max_attempts,
                        error = %attempt.error,
                        "producer attempt failed"
                    );
                },
            )
            .await?;
        Ok(self.run_output(output, parent).await)
    }

    async fn run_cycle(
        &self,
        text: &str,
        mut actions: Vec<Action>,
        parent: Option<SubtaskId>,
    ) -> Subtask {
        let turn = parse_turn(text);
        let mut subtask = Subtask::new(Artifact::text(text), parent);
        subtask.thought = turn.thought;
        actions.extend(turn.actions);

        if actions.is_empty() {
            // Terminal turn: the answer capture, or failing that the
            // whole turn text, is the cycle's artifact. No tool runs.
            let answer = turn
                .answer
                .unwrap_or_else(|| text.trim().to_string());
            debug!(subtask = %subtask.id, "terminal turn, no actions");
            subtask.output = Some(Artifact::text(answer));
            return subtask;
        }

        subtask.actions = actions;
        validate_actions(&mut subtask.actions, self.registry.as_ref());
        self.executor.execute(&mut subtask).await;
        subtask
    }
}

fn action_from_call(tag: &str, name: &str, path: Option<&str>, input: &str) -> Action {
    let mut action = Action::new(tag, name);
    action.path = path.map(str::to_string);
    if input.trim().is_empty() {
        return action;
    }
    match serde_json::from_str::<serde_json::Value>(input) {
        Ok(serde_json::Value::Object(map)) => {
            action.input = map;
            action
        }
        Ok(_) => Action::error(format!(
            "action call '{tag}' input is not a JSON object"
        )),
        Err(err) => Action::error(format!(
            "action call '{tag}' input is not valid JSON: syntax error: {err}"
        )),
    }
}
