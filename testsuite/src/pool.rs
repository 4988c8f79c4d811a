// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use llbsp_pool::{Pool, PoolError};

pub fn test_reserve_free_round_trip() {
    let mut pool = Pool::new(3).unwrap();
    let a = pool.reserve("a").unwrap();
    let before: Vec<_> = pool.iter().map(|(h, v)| (h, *v)).collect();

    let b = pool.reserve("b").unwrap();
    assert_eq!(pool.free(b), Ok("b"));

    let after: Vec<_> = pool.iter().map(|(h, v)| (h, *v)).collect();
    assert_eq!(before, after);
    assert_eq!(pool.used(), 1);
    assert_eq!(pool.free(a), Ok("a"));
    assert_eq!(pool.used(), 0);
}

pub fn test_no_slot_handed_out_twice() {
    let mut pool = Pool::new(4).unwrap();
    let handles: Vec<_> = (0..4).map(|i| pool.reserve(i).unwrap()).collect();
    let slots: HashSet<_> = handles.iter().map(|h| h.index()).collect();
    assert_eq!(slots.len(), 4);
    assert_eq!(pool.reserve(9), Err(PoolError::NoSpaceAvailable));

    // A freed slot comes back, but its old handle stays dead.
    pool.free(handles[2]).unwrap();
    let again = pool.reserve(7).unwrap();
    assert_eq!(again.index(), handles[2].index());
    assert_eq!(pool.free(handles[2]), Err(PoolError::ItemNotFoundInPool));
    assert_eq!(pool.get_ref(again), Ok(&7));
}

pub fn test_lookup_by_predicate() {
    let mut pool = Pool::new(4).unwrap();
    pool.reserve(10).unwrap();
    let h = pool.reserve(20).unwrap();
    assert_eq!(pool.get(|&v| v == 20), Ok(h));
    assert_eq!(pool.get(|&v| v == 30), Err(PoolError::ItemNotFoundInPool));
    pool.free(h).unwrap();
    assert_eq!(pool.get(|&v| v == 20), Err(PoolError::ItemNotFoundInPool));
}
