use murk_core::interp::{Interp, Value};
use murk_core::ir::{
    BinOp, FuncId, Function, IntWidth, ModuleIr, OpKind, Operand, Pred, Terminator,
};
use murk_passes::bogus_flow::{BogusFlow, BogusFlowConfig};
use murk_passes::Transform;
use murk_utils::prng::Prng;

/// A module with one two-argument function doing real arithmetic and a
/// comparison, so the clone mutator has something to chew on.
fn arith_module() -> (ModuleIr, FuncId) {
    let mut m = ModuleIr::new("m");
    let mut f = Function::new("compute");
    f.params = 2;
    let entry = f.add_block("entry");
    let big = f.add_block("big");
    let small = f.add_block("small");

    let sum = f.push_op(
        entry,
        OpKind::Bin {
            op: BinOp::Add,
            width: IntWidth::W32,
        },
        vec![Operand::Arg(0), Operand::Arg(1)],
    );
    let tripled = f.push_op(
        entry,
        OpKind::Bin {
            op: BinOp::Mul,
            width: IntWidth::W32,
        },
        vec![Operand::Value(sum), Operand::Const(3)],
    );
    let cmp = f.push_op(
        entry,
        OpKind::Cmp {
            pred: Pred::Ugt,
            width: IntWidth::W32,
        },
        vec![Operand::Value(tripled), Operand::Const(100)],
    );
    f.set_term(entry, Terminator::CondBr {
        cond: Operand::Value(cmp),
        then_to: big,
        else_to: small,
    });

    let trimmed = f.push_op(
        big,
        OpKind::Bin {
            op: BinOp::Sub,
            width: IntWidth::W32,
        },
        vec![Operand::Value(tripled), Operand::Const(7)],
    );
    f.set_term(big, Terminator::Ret {
        value: Some(Operand::Value(trimmed)),
    });
    f.set_term(small, Terminator::Ret {
        value: Some(Operand::Value(sum)),
    });

    let func = m.add_function(f);
    (m, func)
}

fn run(m: &ModuleIr, func: FuncId, args: &[u64]) -> Option<Value> {
    Interp::new(m).call(func, args).expect("interpretation failed")
}

/// No branch condition may still be the placeholder predicate once the
/// pass returns.
fn assert_no_placeholder_guards(m: &ModuleIr) {
    for func in m.func_ids() {
        let f = m.function(func);
        for block in f.block_ids() {
            if let Terminator::CondBr {
                cond: Operand::Value(op),
                ..
            } = &f.block(block).term
            {
                assert!(
                    !matches!(f.op(*op).kind, OpKind::Cmp {
                        pred: Pred::True,
                        ..
                    }),
                    "unresolved placeholder guard in {}",
                    f.name
                );
            }
        }
    }
}

/// Every successor named by a terminator must be a block of the function.
fn assert_no_dangling_successors(m: &ModuleIr) {
    for func in m.func_ids() {
        let f = m.function(func);
        let blocks = f.block_ids();
        for block in &blocks {
            for succ in f.block(*block).term.successors() {
                assert!(blocks.contains(&succ), "dangling successor in {}", f.name);
            }
        }
    }
}

#[test]
fn single_return_block_grows_to_bogus_shape() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    // One function, one block, one return: probability 100 must wrap it.
    let mut m = ModuleIr::new("m");
    let mut f = Function::new("five");
    let bb = f.add_block("entry");
    f.set_term(bb, Terminator::Ret {
        value: Some(Operand::Const(5)),
    });
    let func = m.add_function(f);

    let pass = BogusFlow::new(BogusFlowConfig {
        probability: 100,
        loops: 1,
        ..Default::default()
    });
    let mut prng = Prng::seeded(42);
    assert!(pass.apply(&mut m, &mut prng).unwrap());

    assert!(
        m.function(func).cfg.node_count() >= 3,
        "expected at least header, original and altered blocks"
    );
    assert_no_dangling_successors(&m);
    assert_no_placeholder_guards(&m);
    assert_eq!(run(&m, func, &[]), Some(Value::Int(5)));
}

#[test]
fn transformed_function_is_observationally_equivalent() {
    let arg_sets: [[u64; 2]; 5] = [[0, 0], [1, 2], [30, 20], [50, 50], [4_000_000_000, 17]];
    let expected: Vec<_> = {
        let (m, func) = arith_module();
        arg_sets.iter().map(|args| run(&m, func, args)).collect()
    };

    for seed in [1u64, 7, 42, 1337, 0xdead_beef] {
        let (mut m, func) = arith_module();
        let pass = BogusFlow::new(BogusFlowConfig {
            probability: 100,
            loops: 1,
            ..Default::default()
        });
        let mut prng = Prng::seeded(seed);
        assert!(pass.apply(&mut m, &mut prng).unwrap());
        assert_no_placeholder_guards(&m);
        assert_no_dangling_successors(&m);
        for (args, want) in arg_sets.iter().zip(&expected) {
            assert_eq!(
                run(&m, func, args),
                *want,
                "seed {seed} diverged on args {args:?}"
            );
        }
    }
}

#[test]
fn repeat_count_compounds() {
    let blocks_after = |loops: u32| {
        let (mut m, func) = arith_module();
        let pass = BogusFlow::new(BogusFlowConfig {
            probability: 100,
            loops,
            ..Default::default()
        });
        let mut prng = Prng::seeded(9);
        pass.apply(&mut m, &mut prng).unwrap();
        m.function(func).cfg.node_count()
    };
    let once = blocks_after(1);
    let twice = blocks_after(2);
    assert!(
        twice > once,
        "a second round must wrap blocks added by the first ({once} vs {twice})"
    );

    // And the result still interprets correctly.
    let (mut m, func) = arith_module();
    let pass = BogusFlow::new(BogusFlowConfig {
        probability: 100,
        loops: 2,
        ..Default::default()
    });
    let mut prng = Prng::seeded(9);
    pass.apply(&mut m, &mut prng).unwrap();
    assert_eq!(run(&m, func, &[30, 20]), Some(Value::Int(143)));
}

#[test]
fn annotated_functions_are_skipped() {
    let (mut m, func) = arith_module();
    m.function_mut(func).annotations.push("nobogus".into());
    let before = m.function(func).cfg.node_count();

    let pass = BogusFlow::new(BogusFlowConfig {
        probability: 100,
        ..Default::default()
    });
    let mut prng = Prng::seeded(42);
    assert!(!pass.apply(&mut m, &mut prng).unwrap());
    assert_eq!(m.function(func).cfg.node_count(), before);
}

#[test]
fn exception_pads_are_not_selected() {
    let mut m = ModuleIr::new("m");
    let mut f = Function::new("handler");
    let bb = f.add_block("pad");
    f.block_mut(bb).eh_pad = true;
    f.set_term(bb, Terminator::Ret { value: None });
    let func = m.add_function(f);

    let pass = BogusFlow::new(BogusFlowConfig {
        probability: 100,
        ..Default::default()
    });
    let mut prng = Prng::seeded(42);
    assert!(!pass.apply(&mut m, &mut prng).unwrap());
    assert_eq!(m.function(func).cfg.node_count(), 1);
}

#[test]
fn fresh_globals_back_each_resolved_guard() {
    let (mut m, _) = arith_module();
    let globals_before = m.globals().count();
    let pass = BogusFlow::new(BogusFlowConfig {
        probability: 100,
        loops: 1,
        ..Default::default()
    });
    let mut prng = Prng::seeded(3);
    pass.apply(&mut m, &mut prng).unwrap();

    // Two placeholders per wrapped block, two globals per placeholder.
    let added = m.globals().count() - globals_before;
    assert!(added > 0 && added % 2 == 0, "unexpected global count {added}");
    assert!(m
        .globals()
        .any(|(_, slot)| slot.name.starts_with("opq_lhs_")));
}
