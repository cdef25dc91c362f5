//! Execution argument bindings

use std::collections::HashMap;

use crate::error::{WoqError, WoqResult};
use crate::memory::Memory;

/// Role a memory plays when a primitive executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRole {
    Src,
    Weights,
    Dst,
    Scratchpad,
    WeightScales,
    WeightZeroPoints,
    /// Second operand of the binary post-op at this index
    PostOpBinarySrc(usize),
}

/// Memories bound to their roles for one execution
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    args: HashMap<ArgRole, Memory>,
}

impl ExecArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `memory` to `role`, returning any previous binding
    pub fn insert(&mut self, role: ArgRole, memory: Memory) -> Option<Memory> {
        self.args.insert(role, memory)
    }

    pub fn get(&self, role: ArgRole) -> Option<&Memory> {
        self.args.get(&role)
    }

    /// Binding for `role`, or an error naming the missing role
    pub fn require(&self, role: ArgRole) -> WoqResult<&Memory> {
        self.args
            .get(&role)
            .ok_or_else(|| WoqError::InvalidArgument(format!("{:?} is not bound", role)))
    }

    pub fn contains(&self, role: ArgRole) -> bool {
        self.args.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Engine;
    use crate::memory::MemoryDesc;
    use crate::tensor::DataType;

    #[test]
    fn test_bind_and_require() {
        let engine = Engine::new(0);
        let desc = MemoryDesc::new(vec![2], DataType::F32, vec![1]).unwrap();
        let memory = Memory::new(desc, engine.allocate_buffer(8).unwrap()).unwrap();

        let mut args = ExecArgs::new();
        assert!(args.insert(ArgRole::PostOpBinarySrc(2), memory.clone()).is_none());
        assert!(args.insert(ArgRole::PostOpBinarySrc(2), memory).is_some());
        assert_eq!(args.len(), 1);
        assert!(args.require(ArgRole::PostOpBinarySrc(2)).is_ok());
        assert!(!args.contains(ArgRole::PostOpBinarySrc(0)));

        let err = args.require(ArgRole::Scratchpad).unwrap_err();
        assert!(err.to_string().contains("Scratchpad"));
    }
}
