use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bytecode::{ConstPool, FunctionInfo, Instruction};
use crate::{ErrorKind, UmkaError, UmkaResult};

use super::passes::{default_pipeline, OptimizePass};
use super::JittedFunction;

/// Applies the ordered optimization pipeline to a copied instruction range.
///
/// The runner never touches the original stream: each task copies the
/// function's code, folds the passes over the copy and hands the result to
/// the manager for publication.
pub struct JitRunner {
    code: Arc<Vec<Instruction>>,
    pool: ConstPool,
    functions: Arc<BTreeMap<u64, FunctionInfo>>,
    passes: Vec<Box<dyn OptimizePass>>,
}

impl JitRunner {
    pub fn new(
        code: Arc<Vec<Instruction>>,
        pool: ConstPool,
        functions: Arc<BTreeMap<u64, FunctionInfo>>,
    ) -> Self {
        Self {
            code,
            pool,
            functions,
            passes: default_pipeline(),
        }
    }

    /// Replaces the default pipeline, mainly for tests.
    pub fn with_passes(mut self, passes: Vec<Box<dyn OptimizePass>>) -> Self {
        self.passes = passes;
        self
    }

    pub fn optimize_function(&self, function_id: u64) -> UmkaResult<JittedFunction> {
        let meta = self.functions.get(&function_id).ok_or_else(|| {
            UmkaError::new(
                ErrorKind::Resolution,
                format!("cannot optimize unknown function {function_id}"),
            )
        })?;
        let end = meta.code_end.min(self.code.len());
        let mut local: Vec<Instruction> = self.code[meta.code_begin..end].to_vec();
        for pass in &self.passes {
            pass.run(&mut local, &self.pool, &self.functions, meta)?;
        }
        Ok(JittedFunction {
            code: local,
            arg_count: meta.arg_count,
            local_count: meta.local_count,
        })
    }

    /// The unoptimized body, used when a pass fails and the manager
    /// publishes "no change".
    pub fn original_body(&self, function_id: u64) -> Option<JittedFunction> {
        let meta = self.functions.get(&function_id)?;
        let end = meta.code_end.min(self.code.len());
        Some(JittedFunction {
            code: self.code[meta.code_begin..end].to_vec(),
            arg_count: meta.arg_count,
            local_count: meta.local_count,
        })
    }
}
