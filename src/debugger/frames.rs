//! Stack of currently open units
//!
//! Frames get monotonically increasing ids that are never reused, so a
//! stale id from the client simply finds nothing. Variable references are
//! derived from the frame id and the scope kind, no lookup table needed.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use super::evaluator::{ExecutionContext, ScopeKind, VariableStore};
use super::listener::UnitKind;

/// One open unit, most recent first in [`FrameStack`]
pub struct StackFrameEntry {
    pub id: i64,
    pub name: String,
    pub kind: UnitKind,
    pub source: Option<String>,
    pub line: u32,
    pub column: u32,
    context: Weak<dyn ExecutionContext>,
    scopes: [Option<Weak<dyn VariableStore>>; 4],
}

impl StackFrameEntry {
    /// Execution context this frame belongs to, if it's still alive
    pub fn context(&self) -> Option<Arc<dyn ExecutionContext>> {
        self.context.upgrade()
    }

    /// Store that was active for `kind` when the frame was entered
    pub fn scope(&self, kind: ScopeKind) -> Option<Arc<dyn VariableStore>> {
        self.scopes[kind.index()].as_ref().and_then(Weak::upgrade)
    }

    pub fn variables_reference(&self, kind: ScopeKind) -> i64 {
        encode_reference(self.id, kind)
    }
}

/// `variablesReference` for a scope of a frame
pub fn encode_reference(frame_id: i64, kind: ScopeKind) -> i64 {
    (frame_id << 2) | kind.index() as i64
}

/// Inverse of [`encode_reference`]
pub fn decode_reference(reference: i64) -> Option<(i64, ScopeKind)> {
    if reference <= 0 {
        return None;
    }
    ScopeKind::from_index((reference & 0b11) as usize).map(|kind| (reference >> 2, kind))
}

/// Where a new frame says it is; missing parts are inherited
#[derive(Debug, Clone, Default)]
pub struct FrameLocation {
    pub source: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

#[derive(Default)]
pub struct FrameStack {
    frames: VecDeque<StackFrameEntry>,
    last_id: i64,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame for a starting unit
    ///
    /// Source, line and column the unit doesn't supply come from the nearest
    /// enclosing frame that has them.
    pub fn push(
        &mut self,
        name: &str,
        kind: UnitKind,
        location: FrameLocation,
        context: &Arc<dyn ExecutionContext>,
    ) -> &StackFrameEntry {
        let FrameLocation {
            mut source,
            mut line,
            mut column,
        } = location;

        for outer in &self.frames {
            if source.is_some() && line.is_some() && column.is_some() {
                break;
            }
            source = source.or_else(|| outer.source.clone());
            line = line.or(Some(outer.line));
            column = column.or(Some(outer.column));
        }

        let scopes = ScopeKind::ALL.map(|scope| context.scope(scope).map(|store| Arc::downgrade(&store)));

        self.last_id += 1;
        self.frames.push_front(StackFrameEntry {
            id: self.last_id,
            name: name.to_string(),
            kind,
            source,
            line: line.unwrap_or(0),
            column: column.unwrap_or(0),
            context: Arc::downgrade(context),
            scopes,
        });
        &self.frames[0]
    }

    pub fn pop(&mut self) -> Option<StackFrameEntry> {
        self.frames.pop_front()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current frame
    pub fn top(&self) -> Option<&StackFrameEntry> {
        self.frames.front()
    }

    /// Frame at `index`, 0 being the current one
    pub fn get(&self, index: usize) -> Option<&StackFrameEntry> {
        self.frames.get(index)
    }

    pub fn find(&self, id: i64) -> Option<&StackFrameEntry> {
        self.frames.iter().find(|frame| frame.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackFrameEntry> {
        self.frames.iter()
    }
}
