//! Built-in node behaviours that only shape scheduling and never do work themselves.

use crate::blueprint::Work;
use crate::core::{Context, Hash32, Value};
use crate::frames::FrameList;

/// Collects its pre tasks so they can be dispatched as one.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskList;

impl Work for TaskList {
    fn hash(&self, _: &Context) -> Hash32 {
        Hash32::NULL
    }
}

/// Requests its pre tasks with extra context variables set.
#[derive(Debug, Clone, Default)]
pub struct ContextVariables {
    vars: Vec<(String, Value)>,
}

impl ContextVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.push((name.into(), value.into()));
        self
    }
}

impl Work for ContextVariables {
    fn hash(&self, _: &Context) -> Hash32 {
        Hash32::NULL
    }

    fn pre_context(&self, context: &Context) -> Option<Context> {
        let context = self
            .vars
            .iter()
            .fold(context.clone(), |ctx, (name, value)| ctx.with(name, value.clone()));
        Some(context)
    }
}

/// Only requests its pre tasks on the frames of its mask.
#[derive(Debug, Clone)]
pub struct FrameMask {
    mask: FrameList,
}

impl FrameMask {
    pub fn new(mask: FrameList) -> Self {
        Self { mask }
    }
}

impl Work for FrameMask {
    fn hash(&self, _: &Context) -> Hash32 {
        Hash32::NULL
    }

    fn pre_context(&self, context: &Context) -> Option<Context> {
        self.mask
            .contains(&context.frame())
            .then(|| context.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_noops() {
        let ctx = Context::new().with_frame(3);
        assert!(TaskList.hash(&ctx).is_null());
        assert!(ContextVariables::new().hash(&ctx).is_null());
        assert!(FrameMask::new(FrameList::single(3)).hash(&ctx).is_null());
    }

    #[test]
    fn test_context_variables_extend_context() {
        let work = ContextVariables::new().with("shot", "sh020").with("frame", 9);
        let ctx = work.pre_context(&Context::new().with_frame(3)).unwrap();
        assert_eq!(ctx.get_str("shot"), Some("sh020"));
        assert_eq!(ctx.frame(), 9);
    }

    #[test]
    fn test_frame_mask() {
        let work = FrameMask::new(FrameList::parse("1-10x3").unwrap());
        assert!(work.pre_context(&Context::new().with_frame(4)).is_some());
        assert!(work.pre_context(&Context::new().with_frame(5)).is_none());
    }
}
