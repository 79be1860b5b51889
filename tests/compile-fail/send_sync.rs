// Check that a value type which isn't `Sync` can't be shared across threads
// through a `ConcurrentStringMap`.
// edition:2021

use std::cell::RefCell;
use std::sync::Arc;
use std::thread;

use callgraph_rcu::csm::ConcurrentStringMap;
use callgraph_rcu::qp::QuiescentState;

// NOTE: we include this so the error points to local source which gives reliable trybuild output
fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(f).join().unwrap();
}

fn main() {
    let qp = QuiescentState::new();
    let h = qp.register();
    let map: Arc<ConcurrentStringMap<RefCell<i32>>> =
        Arc::new(ConcurrentStringMap::with_capacity(4));
    map.add(&qp, &h, "k", RefCell::new(0));

    let map2 = map.clone();
    spawn(move || {
        *map2.get("k").unwrap().borrow_mut() = 1;
    });
    //~^ ERROR: `RefCell<i32>` cannot be shared between threads safely
}
