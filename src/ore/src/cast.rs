// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cast utilities.

/// A trait for safe, simple, and infallible casts.
///
/// `CastFrom` is like [`std::convert::From`], but it is implemented for the
/// platform-dependent integer casts that the standard library leaves out. We
/// only ever target 64-bit platforms, so `u64 -> usize` is lossless for us.
///
/// Prefer `CastFrom` over the `as` operator, which silently truncates.
pub trait CastFrom<T> {
    /// Performs the cast.
    fn cast_from(from: T) -> Self;
}

/// A trait for casts that may lose precision but never panic, e.g. integer
/// counts that end up in floating point rates.
pub trait CastLossy<T> {
    /// Performs the cast, rounding as the `as` operator would.
    fn cast_lossy(from: T) -> Self;
}

macro_rules! cast_from {
    ($from:ty, $to:ty) => {
        impl CastFrom<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_from(from: $from) -> $to {
                from as $to
            }
        }
    };
}

macro_rules! cast_lossy {
    ($from:ty, $to:ty) => {
        impl CastLossy<$from> for $to {
            #[allow(clippy::as_conversions)]
            fn cast_lossy(from: $from) -> $to {
                from as $to
            }
        }
    };
}

cast_from!(u32, usize);
cast_from!(u32, u64);
cast_from!(usize, u64);

#[cfg(target_pointer_width = "64")]
cast_from!(u64, usize);

#[cfg(target_pointer_width = "64")]
cast_from!(usize, i128);

cast_lossy!(u64, f64);
cast_lossy!(usize, f64);
cast_lossy!(i64, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts() {
        assert_eq!(usize::cast_from(7u32), 7);
        assert_eq!(f64::cast_lossy(3u64), 3.0);
    }
}
