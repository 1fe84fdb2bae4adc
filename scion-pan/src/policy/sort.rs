// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stable sorting by a partial order.

/// Sorts `items` stably by a partial order.
///
/// `less(a, b)` returns `Some(true)` if `a` must be ordered before `b`, `Some(false)` if it must
/// not, and `None` if the two are incomparable. Comparable pairs end up in order and incomparable
/// items keep their relative order as far as the comparable ones allow.
///
/// This is an insertion sort with quadratic run time. It is meant for short lists, like the tens
/// of paths to one destination.
pub fn sort_stable_partial_order<T>(items: &mut [T], mut less: impl FnMut(&T, &T) -> Option<bool>) {
    for i in 1..items.len() {
        let mut k = i;
        for j in (0..i).rev() {
            match less(&items[k], &items[j]) {
                Some(true) => {
                    items.swap(j, k);
                    k = j;
                }
                Some(false) => break,
                None => {}
            }
        }
    }
}
