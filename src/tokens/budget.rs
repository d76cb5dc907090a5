//! Token budget allocation.
//!
//! Resolves a resource's configured ceiling into a concrete token count and
//! splits it across allocation classes.
use crate::config::{AllocationClass, MemoryResource};
use crate::error::{MemoryError, MemoryResult};
use crate::types::{Message, Role};

/// Computes effective and per-class token ceilings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenBudgetAllocator;

impl TokenBudgetAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Token ceiling for a memory instance.
    ///
    /// `max_tokens` wins when set; otherwise `floor(context_window * max_context_ratio)`.
    pub fn effective_limit(
        &self,
        resource: &MemoryResource,
        context_window: usize,
    ) -> MemoryResult<usize> {
        if let Some(max_tokens) = resource.max_tokens {
            return Ok(max_tokens);
        }

        let ratio = resource.max_context_ratio.ok_or_else(|| {
            MemoryError::config(format!(
                "resource '{}' has neither max_tokens nor max_context_ratio",
                resource.id
            ))
        })?;

        let limit = ratio_of(context_window, ratio);
        if limit == 0 {
            return Err(MemoryError::config(format!(
                "context window {} with ratio {} leaves no token budget",
                context_window, ratio
            )));
        }
        Ok(limit)
    }

    /// Ceiling for one allocation class given the effective limit.
    ///
    /// `floor(effective_limit * ratio)`, further capped by the `max_tokens`
    /// of any priority block whose `content_types` names the class.
    pub fn class_limit_for(
        &self,
        resource: &MemoryResource,
        class: &AllocationClass,
        effective_limit: usize,
    ) -> MemoryResult<usize> {
        let allocation = resource.token_allocation.as_ref().ok_or_else(|| {
            MemoryError::config(format!(
                "resource '{}' has no token_allocation for class '{}'",
                resource.id, class
            ))
        })?;
        let ratio = allocation.ratio(class).ok_or_else(|| {
            MemoryError::config(format!("unknown allocation class '{}'", class))
        })?;

        let mut limit = ratio_of(effective_limit, ratio);
        for block in &resource.priority_blocks {
            if let Some(cap) = block.max_tokens
                && block.covers(class.name())
            {
                limit = limit.min(cap);
            }
        }
        Ok(limit)
    }

    /// Ceiling for one allocation class.
    pub fn class_limit(
        &self,
        resource: &MemoryResource,
        class: &AllocationClass,
        context_window: usize,
    ) -> MemoryResult<usize> {
        let effective = self.effective_limit(resource, context_window)?;
        self.class_limit_for(resource, class, effective)
    }

    /// Limits for every configured class; empty without `token_allocation`.
    pub fn class_limits(
        &self,
        resource: &MemoryResource,
        effective_limit: usize,
    ) -> MemoryResult<Vec<(AllocationClass, usize)>> {
        let Some(allocation) = &resource.token_allocation else {
            return Ok(Vec::new());
        };
        allocation
            .classes()
            .into_iter()
            .map(|(class, _)| {
                let limit = self.class_limit_for(resource, &class, effective_limit)?;
                Ok((class, limit))
            })
            .collect()
    }
}

fn ratio_of(value: usize, ratio: f64) -> usize {
    (value as f64 * ratio).floor() as usize
}

/// Allocation class a message is accounted against.
pub fn classify(message: &Message, resource: &MemoryResource) -> AllocationClass {
    if message.is_summary() {
        return AllocationClass::LongTerm;
    }
    if message.role == Role::System {
        return AllocationClass::System;
    }
    if let (Some(content_type), Some(allocation)) =
        (message.content_type(), resource.token_allocation.as_ref())
        && allocation.user_defined.contains_key(content_type)
    {
        return AllocationClass::UserDefined(content_type.to_string());
    }
    AllocationClass::ShortTerm
}
