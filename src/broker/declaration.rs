//! Deferred topology declarations.
//!
//! Declarations accumulate during registration and are applied exactly once,
//! against a freshly opened session, when the engine initializes.

use crate::broker::error::{BrokerError, Result, Side};
use crate::broker::transport::{ExchangeKind, Session};

/// An idempotent topology setup action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange { name: String, kind: ExchangeKind },
    Queue { name: String },
    Binding { queue: String, exchange: String, routing_key: String },
}

impl Declaration {
    pub fn exchange(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Declaration::Exchange {
            name: name.into(),
            kind,
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Declaration::Queue { name: name.into() }
    }

    pub fn binding(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Declaration::Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Apply this declaration on `session`.
    pub async fn apply(&self, session: &dyn Session) -> Result<()> {
        match self {
            Declaration::Exchange { name, kind } => session.declare_exchange(name, *kind).await,
            Declaration::Queue { name } => session.declare_queue(name).await,
            Declaration::Binding {
                queue,
                exchange,
                routing_key,
            } => session.bind_queue(queue, exchange, routing_key).await,
        }
    }
}

/// Ordered list of pending declarations for one side of the engine.
#[derive(Debug, Clone)]
pub struct Declarations {
    side: Side,
    pending: Vec<Declaration>,
}

impl Declarations {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            pending: Vec::new(),
        }
    }

    /// Queue a declaration. Equal declarations are kept once.
    pub fn push(&mut self, declaration: Declaration) {
        if !self.pending.contains(&declaration) {
            self.pending.push(declaration);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.pending.iter()
    }

    /// Apply every declaration in order; the first failure aborts.
    pub async fn apply_all(&self, session: &dyn Session) -> Result<()> {
        for declaration in &self.pending {
            declaration
                .apply(session)
                .await
                .map_err(|e| BrokerError::Declare {
                    side: self.side,
                    source: Box::new(e),
                })?;
            tracing::debug!(side = %self.side, ?declaration, "Declared");
        }
        Ok(())
    }
}
