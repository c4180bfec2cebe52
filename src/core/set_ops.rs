// SPDX-License-Identifier: Apache-2.0
//! Shared `difference`/`intersection` signature across the three
//! container levels (`Dataset`, `Pool`, `PoolList`).
//!
//! Each level implements the same shape but isn't required to share a
//! concrete type — a trait suffices (see DESIGN.md, §9 "Polymorphism").

pub trait SetOps: Sized + 'static {
    /// All elements present in `self` but absent from every one of
    /// `others`.
    fn difference<'a>(&self, others: impl IntoIterator<Item = &'a Self>) -> Self
    where
        Self: 'a;

    /// All elements present in `self` and in every one of `others`.
    fn intersection<'a>(&self, others: impl IntoIterator<Item = &'a Self>) -> Self
    where
        Self: 'a;
}
