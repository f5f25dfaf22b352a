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

//! Statistics utilities.

/// Returns power-of-two buckets spanning `[from, to]` seconds.
///
/// # Panics
///
/// Panics if `from` is not positive or `to < from`.
pub fn histogram_seconds_buckets(from: f64, to: f64) -> Vec<f64> {
    power_of_two_buckets(from, to)
}

/// Returns power-of-two buckets spanning `[from, to]` bytes.
pub fn histogram_byte_buckets(from: f64, to: f64) -> Vec<f64> {
    power_of_two_buckets(from, to)
}

fn power_of_two_buckets(from: f64, to: f64) -> Vec<f64> {
    assert!(from > 0.0, "bucket lower bound must be positive");
    assert!(to >= from, "bucket upper bound must not be below lower bound");
    let mut buckets = vec![from];
    let mut next = from;
    while next < to {
        next *= 2.0;
        buckets.push(next);
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_doubling() {
        assert_eq!(histogram_seconds_buckets(0.25, 2.0), vec![0.25, 0.5, 1.0, 2.0]);
        assert_eq!(histogram_byte_buckets(1.0, 5.0), vec![1.0, 2.0, 4.0, 8.0]);
        assert_eq!(histogram_byte_buckets(8.0, 8.0), vec![8.0]);
    }
}
