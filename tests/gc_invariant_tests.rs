//! Property-based tests for collector invariants
//!
//! Random mutation programs run against a heap and a simple model of what
//! each rooted object should contain. After every collection the heap must
//! verify, every rooted object must still hold what the model says, locked
//! objects must not have moved, and an immediate second collection must
//! change nothing.

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use frameheap::{Heap, HeapConfig, ObjectKind, RootId, Value};

#[derive(Debug, Clone)]
enum Op {
    AllocArray { len: usize, rooted: bool },
    AllocBinary { len: usize, rooted: bool },
    Link { from: usize, to: usize, slot: usize },
    StoreInt { target: usize, slot: usize, value: i64 },
    DropRoot { index: usize },
    Lock { index: usize },
    Collect,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..24, any::<bool>()).prop_map(|(len, rooted)| Op::AllocArray { len, rooted }),
        2 => (0usize..64, any::<bool>()).prop_map(|(len, rooted)| Op::AllocBinary { len, rooted }),
        3 => (any::<usize>(), any::<usize>(), any::<usize>())
            .prop_map(|(from, to, slot)| Op::Link { from, to, slot }),
        2 => (any::<usize>(), any::<usize>(), any::<i64>())
            .prop_map(|(target, slot, value)| Op::StoreInt { target, slot, value }),
        1 => any::<usize>().prop_map(|index| Op::DropRoot { index }),
        1 => any::<usize>().prop_map(|index| Op::Lock { index }),
        1 => Just(Op::Collect),
    ]
}

/// Expected content of one array element.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Expected {
    Nil,
    Int(i64),
    /// Reference to the object whose class is `Int(id)`.
    Object(i64),
}

#[derive(Debug)]
enum Shape {
    Array(Vec<Expected>),
    Binary(usize),
}

#[derive(Debug)]
struct Tracked {
    root: RootId,
    id: i64,
    shape: Shape,
    locked: bool,
}

struct Model {
    heap: Heap,
    tracked: Vec<Tracked>,
    next_id: i64,
}

impl Model {
    fn new() -> Self {
        let config = HeapConfig {
            arena_slots: 4096,
            // Room to bank a gap in front of every locked block.
            free_stack_capacity: 64,
            ..HeapConfig::default()
        };
        Self {
            heap: Heap::new(config).unwrap(),
            tracked: Vec::new(),
            next_id: 1,
        }
    }

    fn fresh_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        match *op {
            Op::AllocArray { len, rooted } => {
                let id = self.fresh_id();
                let array = self.heap.allocate_array(Value::Int(id), len).unwrap();
                if rooted {
                    let root = self.heap.add_root(array).unwrap();
                    self.tracked.push(Tracked {
                        root,
                        id,
                        shape: Shape::Array(vec![Expected::Nil; len]),
                        locked: false,
                    });
                }
            }
            Op::AllocBinary { len, rooted } => {
                let id = self.fresh_id();
                let binary = self.heap.allocate_binary(Value::Int(id), len).unwrap();
                self.heap.write_bytes(binary, 0, &vec![id as u8; len]).unwrap();
                if rooted {
                    let root = self.heap.add_root(binary).unwrap();
                    self.tracked.push(Tracked {
                        root,
                        id,
                        shape: Shape::Binary(len),
                        locked: false,
                    });
                }
            }
            Op::Link { from, to, slot } => {
                if self.tracked.is_empty() {
                    return Ok(());
                }
                let to = &self.tracked[to % self.tracked.len()];
                let (target, target_id) = (self.heap.root(to.root).unwrap(), to.id);
                let from = from % self.tracked.len();
                let holder = self.heap.root(self.tracked[from].root).unwrap();
                if let Shape::Array(elements) = &mut self.tracked[from].shape {
                    if !elements.is_empty() {
                        let slot = slot % elements.len();
                        self.heap.set_slot(holder, slot, target).unwrap();
                        elements[slot] = Expected::Object(target_id);
                    }
                }
            }
            Op::StoreInt { target, slot, value } => {
                if self.tracked.is_empty() {
                    return Ok(());
                }
                let target = target % self.tracked.len();
                let holder = self.heap.root(self.tracked[target].root).unwrap();
                if let Shape::Array(elements) = &mut self.tracked[target].shape {
                    if !elements.is_empty() {
                        let slot = slot % elements.len();
                        self.heap.set_slot(holder, slot, Value::Int(value)).unwrap();
                        elements[slot] = Expected::Int(value);
                    }
                }
            }
            Op::DropRoot { index } => {
                if self.tracked.is_empty() {
                    return Ok(());
                }
                let tracked = self.tracked.remove(index % self.tracked.len());
                self.heap.remove_root(tracked.root).unwrap();
            }
            Op::Lock { index } => {
                if self.tracked.is_empty() {
                    return Ok(());
                }
                let index = index % self.tracked.len();
                let value = self.heap.root(self.tracked[index].root).unwrap();
                self.heap.lock(value).unwrap();
                self.tracked[index].locked = true;
            }
            Op::Collect => self.collect_and_check()?,
        }
        Ok(())
    }

    fn collect_and_check(&mut self) -> Result<(), TestCaseError> {
        let pinned: Vec<_> = self
            .tracked
            .iter()
            .filter(|t| t.locked)
            .map(|t| (t.root, self.heap.root(t.root).unwrap().addr()))
            .collect();

        let first = self.heap.collect().unwrap();
        self.heap.verify().unwrap();
        self.check_contents()?;
        for (root, addr) in pinned {
            prop_assert_eq!(self.heap.root(root).unwrap().addr(), addr);
        }

        let before: Vec<_> = self
            .tracked
            .iter()
            .map(|t| self.heap.root(t.root).unwrap())
            .collect();
        let second = self.heap.collect().unwrap();
        prop_assert_eq!(second.reclaimed_slots, 0);
        prop_assert_eq!(second.moved_objects, 0);
        prop_assert_eq!(second.epoch, first.epoch);
        prop_assert_eq!(second.live_slots, first.live_slots);
        let after: Vec<_> = self
            .tracked
            .iter()
            .map(|t| self.heap.root(t.root).unwrap())
            .collect();
        prop_assert_eq!(before, after);
        Ok(())
    }

    fn check_contents(&self) -> Result<(), TestCaseError> {
        let heap = &self.heap;
        for tracked in &self.tracked {
            let value = heap.root(tracked.root).unwrap();
            prop_assert_eq!(heap.deref(value).unwrap(), value);
            prop_assert_eq!(heap.class_of(value).unwrap(), Value::Int(tracked.id));
            match &tracked.shape {
                Shape::Array(elements) => {
                    prop_assert_eq!(heap.kind_of(value).unwrap(), ObjectKind::Array);
                    let slots = heap.slots(value).unwrap();
                    prop_assert_eq!(slots.len(), elements.len());
                    for (actual, expected) in slots.into_iter().zip(elements) {
                        match *expected {
                            Expected::Nil => prop_assert_eq!(actual, Value::Nil),
                            Expected::Int(i) => prop_assert_eq!(actual, Value::Int(i)),
                            Expected::Object(id) => {
                                prop_assert_eq!(heap.class_of(actual).unwrap(), Value::Int(id));
                            }
                        }
                    }
                }
                Shape::Binary(len) => {
                    prop_assert_eq!(heap.kind_of(value).unwrap(), ObjectKind::Binary);
                    prop_assert_eq!(
                        heap.read_bytes(value).unwrap(),
                        vec![tracked.id as u8; *len]
                    );
                }
            }
        }
        Ok(())
    }
}

proptest! {
    /// Invariant: collection preserves everything reachable from roots and
    /// a repeated collection is a no-op
    #[test]
    fn collections_preserve_rooted_graphs(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        model.collect_and_check()?;
    }

    /// Invariant: once every root is gone the whole arena is free again
    #[test]
    fn dropping_every_root_frees_the_arena(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op)?;
        }
        for tracked in model.tracked.drain(..) {
            model.heap.remove_root(tracked.root).unwrap();
        }
        model.heap.collect().unwrap();
        let stats = model.heap.stats();
        prop_assert_eq!(stats.live_blocks, 0);
        prop_assert_eq!(stats.free_blocks, 1);
        prop_assert_eq!(stats.free_slots, stats.total_slots);
    }
}
