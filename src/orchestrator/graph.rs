//! Node-graph driver.
//!
//! Runs the same primitives as the legacy loop, expressed as explicit nodes
//! with the transition table in one place:
//!
//! ```text
//! Admit -> CallModel -> DispatchTools -> CallModel -> ... -> Finish -> End
//! ```
//!
//! Given the same provider script both drivers produce the same events,
//! persisted messages and outcome.

use tracing::{debug, info_span, Instrument};

use super::engine::{Engine, Step};
use crate::error::Result;
use crate::provider::ModelResponse;

enum Node {
    Admit,
    CallModel,
    DispatchTools(ModelResponse),
    Finish(ModelResponse),
    End,
}

impl Node {
    fn name(&self) -> &'static str {
        match self {
            Self::Admit => "admit",
            Self::CallModel => "call_model",
            Self::DispatchTools(_) => "dispatch_tools",
            Self::Finish(_) => "finish",
            Self::End => "end",
        }
    }
}

pub(crate) async fn run_graph(engine: &mut Engine<'_>) -> Result<()> {
    let mut node = Node::Admit;
    loop {
        debug!(node = node.name(), round = engine.state.round, "graph step");
        node = match node {
            Node::Admit => {
                engine.admit().await?;
                Node::CallModel
            }
            Node::CallModel => {
                engine.begin_round()?;
                let span = info_span!("round", round = engine.state.round);
                let response = engine.call_model().instrument(span).await?;
                match engine.classify(response)? {
                    Step::Tools(response) => Node::DispatchTools(response),
                    Step::Finish(response) => Node::Finish(response),
                }
            }
            Node::DispatchTools(response) => {
                let span = info_span!("round", round = engine.state.round);
                engine.dispatch_tools(response).instrument(span).await?;
                Node::CallModel
            }
            Node::Finish(response) => {
                engine.finish(response).await?;
                Node::End
            }
            Node::End => return Ok(()),
        };
    }
}
