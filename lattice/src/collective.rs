// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Collective operations over a team.
//!
//! Every call is collective across all members of the named team; buffer
//! sizes are bytes, root parameters are the caller's team-unit ids, and
//! buffers are safe to reuse on return. `allgather` is specified as
//! gather-to-0 followed by bcast-from-0; the driver is free to fuse the
//! two (the in-process driver does).
//!
//! Reductions fold element-wise with an operation from a closed set over
//! a closed set of datatypes; user-defined reductions register a function
//! pointer and a commutativity flag. Contributions are always folded in
//! ascending rank order, so non-commutative user operations are
//! well-defined.

use crate::error::{ErrorCode, Result};
use crate::runtime::Runtime;
use crate::team::TeamId;
use crate::unit::TeamUnit;
use core::fmt;

/// Element datatype tags for reductions and typed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Untyped bytes; only bitwise operations apply.
    Byte,
    /// A user-defined element of the given size, reduced by a user
    /// operation.
    User(u32),
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 | DataType::Byte => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
            DataType::User(size) => usize::try_from(size).unwrap(),
        }
    }
}

/// Reduction operation tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    Band,
    Bor,
    Bxor,
    Land,
    Lor,
    /// Minimum value with the rank-ordered first index carrying it;
    /// elements are (value, i32 index) pairs.
    MinLoc,
    /// Maximum value with the rank-ordered first index carrying it.
    MaxLoc,
    /// A user operation registered with
    /// [`Runtime::reduce_op_register`].
    User(UserOpId),
}

/// Handle to a registered user reduction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserOpId(u32);

impl fmt::Debug for UserOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[user op {}]", self.0)
    }
}

/// A user reduction: folds `contrib` into `acc`, both holding whole
/// element buffers of the reduced datatype.
pub type UserReduceFn = fn(acc: &mut [u8], contrib: &[u8]);

pub(crate) struct UserOp {
    pub func: UserReduceFn,
    /// Recorded for drivers that reorder commutative folds; the
    /// in-process driver always folds in rank order.
    #[allow(dead_code)]
    pub commutative: bool,
}

// === collective operations on the runtime handle ===

impl Runtime {
    /// Barrier over every member of `team`.
    pub fn barrier(&self, team: TeamId) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        self.driver().barrier(slot.comm)
    }

    /// Broadcasts `buf` from `root` to every member.
    pub fn bcast(&self, team: TeamId, root: TeamUnit, buf: &mut [u8]) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        self.driver().bcast(slot.comm, root.get(), buf)
    }

    /// Gathers `send` from every member into `recv` at `root` in
    /// team-unit order. `recv` must hold `send.len() * team.size` bytes
    /// at the root and is ignored elsewhere.
    pub fn gather(
        &self,
        team: TeamId,
        root: TeamUnit,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        if slot.my_unit == root && recv.len() != send.len() * slot.size() {
            return Err(ErrorCode::Inval);
        }
        self.driver().gather(slot.comm, root.get(), send, recv)
    }

    /// Scatters equal chunks of `send` at `root` into every member's
    /// `recv`.
    pub fn scatter(
        &self,
        team: TeamId,
        root: TeamUnit,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        if slot.my_unit == root && send.len() != recv.len() * slot.size() {
            return Err(ErrorCode::Inval);
        }
        self.driver().scatter(slot.comm, root.get(), send, recv)
    }

    /// Gathers `send` from every member into every member's `recv`.
    /// With `send.len() == 0` this is a plain barrier.
    pub fn allgather(&self, team: TeamId, send: &[u8], recv: &mut [u8]) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        if send.is_empty() {
            return self.driver().barrier(slot.comm);
        }
        if recv.len() != send.len() * slot.size() {
            return Err(ErrorCode::Inval);
        }
        self.driver().allgather(slot.comm, send, recv)
    }

    /// Reduces `send` element-wise into `recv` at `root`.
    pub fn reduce(
        &self,
        team: TeamId,
        root: TeamUnit,
        send: &[u8],
        recv: &mut [u8],
        op: ReduceOp,
        dtype: DataType,
    ) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        check_reduce_buffers(send, op, dtype)?;
        let combine = self.combiner(op, dtype)?;
        self.driver()
            .reduce(slot.comm, root.get(), send, recv, &*combine)
    }

    /// Reduces `send` element-wise into `recv` on every member.
    pub fn allreduce(
        &self,
        team: TeamId,
        send: &[u8],
        recv: &mut [u8],
        op: ReduceOp,
        dtype: DataType,
    ) -> Result<()> {
        self.reduce(team, TeamUnit::new(0), send, recv, op, dtype)?;
        self.bcast(team, TeamUnit::new(0), recv)
    }

    /// Registers a user reduction for use as [`ReduceOp::User`].
    pub fn reduce_op_register(
        &self,
        func: UserReduceFn,
        commutative: bool,
    ) -> Result<ReduceOp> {
        self.ensure_running()?;
        let mut ops = self.user_ops().lock().unwrap();
        let id = u32::try_from(ops.len()).map_err(|_| ErrorCode::Other)?;
        ops.push(UserOp { func, commutative });
        Ok(ReduceOp::User(UserOpId(id)))
    }

    /// Builds the element-blind fold for `(op, dtype)` handed to the
    /// driver.
    fn combiner(
        &self,
        op: ReduceOp,
        dtype: DataType,
    ) -> Result<Box<dyn Fn(&mut [u8], &[u8]) + Sync + '_>> {
        if let ReduceOp::User(id) = op {
            let func = {
                let ops = self.user_ops().lock().unwrap();
                ops.get(usize::try_from(id.0).unwrap())
                    .ok_or(ErrorCode::NotFound)?
                    .func
            };
            return Ok(Box::new(move |acc: &mut [u8], contrib: &[u8]| {
                func(acc, contrib);
            }));
        }
        let fold = element_fold(op, dtype)?;
        Ok(Box::new(move |acc: &mut [u8], contrib: &[u8]| {
            fold(acc, contrib);
        }))
    }
}

fn check_reduce_buffers(send: &[u8], op: ReduceOp, dtype: DataType) -> Result<()> {
    let stride = match op {
        ReduceOp::MinLoc | ReduceOp::MaxLoc => loc_stride(dtype)?,
        ReduceOp::User(_) => return Ok(()),
        _ => dtype.size(),
    };
    if stride == 0 || !send.len().is_multiple_of(stride) {
        return Err(ErrorCode::Inval);
    }
    Ok(())
}

/// Element stride of a (value, i32 index) pair, packed without padding.
fn loc_stride(dtype: DataType) -> Result<usize> {
    match dtype {
        DataType::I32 | DataType::U32 | DataType::F32 | DataType::I64 | DataType::U64
        | DataType::F64 => Ok(dtype.size() + 4),
        _ => Err(ErrorCode::Inval),
    }
}

/// An element-wise fold over whole contribution buffers.
type Fold = Box<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Element-wise folds for the closed operation/datatype sets. Logical and
/// bitwise operations reject floating-point elements.
fn element_fold(op: ReduceOp, dtype: DataType) -> Result<Fold> {
    macro_rules! int_fold {
        ($ty:ty) => {
            Ok(match op {
                ReduceOp::Sum => fold_elems::<$ty>(|a, b| a.wrapping_add(b)),
                ReduceOp::Prod => fold_elems::<$ty>(|a, b| a.wrapping_mul(b)),
                ReduceOp::Min => fold_elems::<$ty>(|a, b| a.min(b)),
                ReduceOp::Max => fold_elems::<$ty>(|a, b| a.max(b)),
                ReduceOp::Band => fold_elems::<$ty>(|a, b| a & b),
                ReduceOp::Bor => fold_elems::<$ty>(|a, b| a | b),
                ReduceOp::Bxor => fold_elems::<$ty>(|a, b| a ^ b),
                ReduceOp::Land => fold_elems::<$ty>(|a, b| ((a != 0) && (b != 0)) as $ty),
                ReduceOp::Lor => fold_elems::<$ty>(|a, b| ((a != 0) || (b != 0)) as $ty),
                ReduceOp::MinLoc => fold_loc::<$ty>(false),
                ReduceOp::MaxLoc => fold_loc::<$ty>(true),
                ReduceOp::User(_) => unreachable!("handled by the caller"),
            })
        };
    }
    macro_rules! float_fold {
        ($ty:ty) => {
            match op {
                ReduceOp::Sum => Ok(fold_elems::<$ty>(|a, b| a + b)),
                ReduceOp::Prod => Ok(fold_elems::<$ty>(|a, b| a * b)),
                ReduceOp::Min => Ok(fold_elems::<$ty>(<$ty>::min)),
                ReduceOp::Max => Ok(fold_elems::<$ty>(<$ty>::max)),
                ReduceOp::MinLoc => Ok(fold_loc::<$ty>(false)),
                ReduceOp::MaxLoc => Ok(fold_loc::<$ty>(true)),
                _ => Err(ErrorCode::Inval),
            }
        };
    }

    match dtype {
        DataType::I8 => int_fold!(i8),
        DataType::I16 => int_fold!(i16),
        DataType::I32 => int_fold!(i32),
        DataType::I64 => int_fold!(i64),
        DataType::U8 | DataType::Byte => int_fold!(u8),
        DataType::U16 => int_fold!(u16),
        DataType::U32 => int_fold!(u32),
        DataType::U64 => int_fold!(u64),
        DataType::F32 => float_fold!(f32),
        DataType::F64 => float_fold!(f64),
        DataType::User(_) => Err(ErrorCode::Inval),
    }
}

trait Element: Copy {
    fn read(bytes: &[u8]) -> Self;
    fn write(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(impl Element for $ty {
            fn read(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes[..size_of::<$ty>()].try_into().unwrap())
            }
            fn write(self, bytes: &mut [u8]) {
                bytes[..size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
            }
        })*
    };
}

impl_element!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

fn fold_elems<T: Element + 'static>(f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Fold {
    Box::new(move |acc: &mut [u8], contrib: &[u8]| {
        let stride = size_of::<T>();
        debug_assert_eq!(acc.len(), contrib.len());
        for (a, c) in acc
            .chunks_exact_mut(stride)
            .zip(contrib.chunks_exact(stride))
        {
            f(T::read(a), T::read(c)).write(a);
        }
    })
}

/// Fold for the `MinLoc`/`MaxLoc` pair elements: value followed by a
/// packed `i32` index. Ties keep the accumulator, which holds the lower
/// rank's contribution.
fn fold_loc<T: Element + PartialOrd + 'static>(max: bool) -> Fold {
    Box::new(move |acc: &mut [u8], contrib: &[u8]| {
        let stride = size_of::<T>() + 4;
        debug_assert_eq!(acc.len(), contrib.len());
        for (a, c) in acc
            .chunks_exact_mut(stride)
            .zip(contrib.chunks_exact(stride))
        {
            let av = T::read(a);
            let cv = T::read(c);
            let replace = if max { cv > av } else { cv < av };
            if replace {
                a.copy_from_slice(c);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold_buf(op: ReduceOp, dtype: DataType, acc: &mut [u8], contrib: &[u8]) {
        element_fold(op, dtype).unwrap()(acc, contrib);
    }

    fn as_i32s(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn from_i32s(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn sum_and_minmax_i32() {
        let mut acc = from_i32s(&[1, -5, 100]);
        fold_buf(ReduceOp::Sum, DataType::I32, &mut acc, &from_i32s(&[2, 5, -1]));
        assert_eq!(as_i32s(&acc), vec![3, 0, 99]);

        let mut acc = from_i32s(&[1, -5, 100]);
        fold_buf(ReduceOp::Min, DataType::I32, &mut acc, &from_i32s(&[2, -7, 100]));
        assert_eq!(as_i32s(&acc), vec![1, -7, 100]);

        let mut acc = from_i32s(&[1, -5, 100]);
        fold_buf(ReduceOp::Max, DataType::I32, &mut acc, &from_i32s(&[2, -7, 100]));
        assert_eq!(as_i32s(&acc), vec![2, -5, 100]);
    }

    #[test]
    fn logical_and_bitwise() {
        let mut acc = from_i32s(&[0b1100, 3, 0]);
        fold_buf(ReduceOp::Band, DataType::I32, &mut acc, &from_i32s(&[0b1010, 1, 1]));
        assert_eq!(as_i32s(&acc), vec![0b1000, 1, 0]);

        let mut acc = from_i32s(&[5, 0]);
        fold_buf(ReduceOp::Land, DataType::I32, &mut acc, &from_i32s(&[2, 9]));
        assert_eq!(as_i32s(&acc), vec![1, 0]);

        assert!(matches!(
            element_fold(ReduceOp::Band, DataType::F32),
            Err(ErrorCode::Inval)
        ));
    }

    #[test]
    fn minloc_keeps_lower_rank_on_ties() {
        // pairs of (f64 value, i32 loc), packed
        fn pair(v: f64, loc: i32) -> Vec<u8> {
            let mut out = v.to_ne_bytes().to_vec();
            out.extend_from_slice(&loc.to_ne_bytes());
            out
        }
        let mut acc = pair(1.5, 0);
        let fold = fold_loc::<f64>(false);
        fold(&mut acc, &pair(1.5, 1));
        assert_eq!(acc, pair(1.5, 0));
        fold(&mut acc, &pair(0.5, 2));
        assert_eq!(acc, pair(0.5, 2));
    }

    #[test]
    fn stride_validation() {
        // 6 bytes is not a multiple of 4
        assert_eq!(
            check_reduce_buffers(&[0u8; 6], ReduceOp::Sum, DataType::I32),
            Err(ErrorCode::Inval)
        );
        assert!(check_reduce_buffers(&[0u8; 8], ReduceOp::Sum, DataType::I32).is_ok());
        // minloc over f64: stride 12
        assert!(check_reduce_buffers(&[0u8; 24], ReduceOp::MinLoc, DataType::F64).is_ok());
        assert_eq!(
            check_reduce_buffers(&[0u8; 8], ReduceOp::MinLoc, DataType::I8),
            Err(ErrorCode::Inval)
        );
    }
}
