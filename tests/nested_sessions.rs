use approx::assert_relative_eq;
use nested_tape::tape::{try_with_active_tape, Tape, TapeGuard};
use nested_tape::{NestedSession, Var};

fn active_len() -> usize {
    try_with_active_tape(|t: &mut Tape<f64>| t.len()).unwrap()
}

fn open_sessions() -> usize {
    try_with_active_tape(|t: &mut Tape<f64>| t.stats().open_sessions).unwrap()
}

#[test]
fn dropped_session_leaves_no_trace() {
    let mut tape = Tape::<f64>::new();
    let x = tape.new_variable(1.5);
    let _guard = TapeGuard::new(&mut tape);
    let y = x * x;
    let before = active_len();
    {
        let session = NestedSession::<f64>::new();
        assert_eq!(session.start(), before);
        let z = (y * 3.0).exp() + x;
        let _ = z.sin();
        assert_eq!(session.len(), 4);
    }
    assert_eq!(active_len(), before);
    assert_eq!(open_sessions(), 0);

    // The outer tape is intact and differentiates as before.
    y.grad();
    assert_relative_eq!(x.adj(), 3.0);
}

#[test]
fn nested_grad_replays_only_the_region() {
    let mut tape = Tape::<f64>::new();
    let x = tape.new_variable(2.0);
    let _guard = TapeGuard::new(&mut tape);
    let outer = x * x; // never replayed by the session

    let session = NestedSession::<f64>::new();
    let leaf = Var::variable(3.0);
    let y = leaf * outer;
    session.grad(y);

    assert_relative_eq!(leaf.adj(), 4.0);
    // The outer node received its contribution but did not propagate it.
    let outer_adj = try_with_active_tape(|t: &mut Tape<f64>| t.adjoint(outer)).unwrap();
    assert_relative_eq!(outer_adj, 3.0);
    assert_eq!(x.adj(), 0.0);
}

#[test]
fn nested_grad_rezeroes_the_region() {
    let mut tape = Tape::<f64>::new();
    let _guard = TapeGuard::new(&mut tape);
    let session = NestedSession::<f64>::new();
    let a = Var::variable(1.0);
    let b = a * a * a;
    session.grad(b);
    session.grad(b);
    assert_relative_eq!(a.adj(), 3.0);
    session.set_zero_adjoints();
    assert_eq!(a.adj(), 0.0);
}

#[test]
fn rewind_keeps_session_open() {
    let mut tape = Tape::<f64>::new();
    let _guard = TapeGuard::new(&mut tape);
    let base = Var::variable(0.5);

    let mut session = NestedSession::<f64>::new();
    for i in 0..5 {
        let leaf = Var::variable(i as f64);
        let y = leaf * leaf + base.value();
        session.grad(y);
        assert_relative_eq!(leaf.adj(), 2.0 * i as f64);
        assert_eq!(leaf.index() as usize, session.start());
        session.rewind();
        assert!(session.is_empty());
        assert_eq!(open_sessions(), 1);
    }
    drop(session);
    assert_eq!(active_len(), 1);
}

#[test]
fn merge_keeps_nested_nodes() {
    let mut tape = Tape::<f64>::new();
    let x = tape.new_variable(2.0);
    let _guard = TapeGuard::new(&mut tape);
    let session = NestedSession::<f64>::new();
    let y = x.exp() * x;
    session.merge();
    assert_eq!(open_sessions(), 0);
    assert_eq!(active_len(), 3);

    y.grad();
    let e = 2.0_f64.exp();
    assert_relative_eq!(x.adj(), e * 2.0 + e, max_relative = 1e-12);
}

#[test]
fn sessions_nest_in_stack_order() {
    let mut tape = Tape::<f64>::new();
    let _guard = TapeGuard::new(&mut tape);
    let x = Var::variable(1.0);

    let outer = NestedSession::<f64>::new();
    let a = x * 2.0;
    {
        let inner = NestedSession::<f64>::new();
        assert_eq!(inner.depth(), 2);
        let b = a * a;
        inner.grad(b);
        assert_relative_eq!(
            try_with_active_tape(|t: &mut Tape<f64>| t.adjoint(a)).unwrap(),
            4.0
        );
        assert_eq!(open_sessions(), 2);
    }
    assert_eq!(outer.depth(), 1);
    assert_eq!(outer.len(), 1);
    outer.grad(a);
    assert_relative_eq!(x.adj(), 2.0);
    drop(outer);
    assert_eq!(active_len(), 1);
}

#[test]
#[should_panic(expected = "recorded before the session")]
fn nested_grad_rejects_outer_output() {
    let mut tape = Tape::<f64>::new();
    let _guard = TapeGuard::new(&mut tape);
    let x = Var::variable(1.0);
    let y = x * x;
    let session = NestedSession::<f64>::new();
    session.grad(y);
}

#[test]
fn session_on_worker_tape_does_not_touch_outer() {
    let mut outer = Tape::<f64>::new();
    let x = outer.new_variable(3.0);
    let outer_len = outer.len();

    let (value, partial) = nested_tape::with_pooled_tape(|worker: &mut Tape<f64>| {
        let _guard = TapeGuard::new(worker);
        let session = NestedSession::<f64>::new();
        let local = Var::variable(x.value());
        let y = local.powi(3);
        session.grad(y);
        (y.value(), local.adj())
    });

    assert_eq!(outer.len(), outer_len);
    assert_relative_eq!(value, 27.0);
    assert_relative_eq!(partial, 27.0);
}
