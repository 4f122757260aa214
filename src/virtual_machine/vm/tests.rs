use super::*;
use crate::virtual_machine::assembler::assemble_source;
use crate::virtual_machine::errors::Attribution;
use crate::virtual_machine::host::StandaloneHost;
use crate::virtual_machine::isa::Field;
use crate::virtual_machine::operand::RegType;
use crate::virtual_machine::function::ScriptFunction;
use crate::virtual_machine::program::{CompiledFunction, Symbol};
use crate::virtual_machine::value::Address;

fn load(vm: &mut Vm, host: &StandaloneHost, source: &str) -> Vec<FunctionId> {
    let module = assemble_source(source).expect("assembly failed");
    vm.load_module(host, &module).expect("link failed")
}

fn fresh(source: &str) -> (Vm, StandaloneHost) {
    let host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    load(&mut vm, &host, source);
    (vm, host)
}

fn call(
    vm: &mut Vm,
    host: &mut StandaloneHost,
    name: &str,
    args: &[Value],
    types: &[RegType],
) -> Result<Vec<Option<Value>>, ScriptAbort> {
    let mut slots: Vec<ReturnSlot> = types.iter().copied().map(ReturnSlot::new).collect();
    vm.call_by_name(host, name, args, &mut slots)?;
    Ok(slots.into_iter().map(|slot| slot.value).collect())
}

fn run_main(source: &str, ty: RegType) -> Result<Option<Value>, ScriptAbort> {
    let (mut vm, mut host) = fresh(source);
    let mut results = call(&mut vm, &mut host, "Main", &[], &[ty])?;
    Ok(results.remove(0))
}

fn run_int(source: &str) -> i32 {
    run_main(source, RegType::INT)
        .expect("script aborted")
        .and_then(|v| v.as_int())
        .expect("no int result")
}

fn run_float(source: &str) -> f64 {
    run_main(source, RegType::FLOAT)
        .expect("script aborted")
        .and_then(|v| v.as_float())
        .expect("no float result")
}

fn run_abort(source: &str) -> ScriptAbort {
    run_main(source, RegType::INT).expect_err("expected an abort")
}

fn int_result(results: &[Option<Value>], slot: usize) -> i32 {
    results[slot].as_ref().and_then(Value::as_int).expect("no int result")
}

fn detail(abort: &ScriptAbort) -> &str {
    abort.detail.as_deref().unwrap_or_default()
}

fn native_add(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    args: &[Value],
    results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let sum = args.iter().filter_map(Value::as_int).sum::<i32>();
    if let Some(slot) = results.first_mut() {
        slot.set(0, Value::Int(sum))?;
    }
    Ok(1)
}

fn native_sum_floats(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    args: &[Value],
    results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let sum = args.iter().filter_map(Value::as_float).sum::<f64>();
    if let Some(slot) = results.first_mut() {
        slot.set(0, Value::Float(sum))?;
    }
    Ok(1)
}

#[test]
fn native_call_through_staged_parameters() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    let add = vm.functions_mut().register_native("add", native_add);
    load(
        &mut vm,
        &host,
        "
        .func Main
            PARAM 3
            PARAM 4
            CALL_K @add, 2, 1
            RESULT d0
            RET 0!, d0
        .end
        ",
    );

    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 7);

    let mut slots = [ReturnSlot::new(RegType::INT)];
    let count = vm
        .call(&mut host, add, &[Value::Int(3), Value::Int(4)], &mut slots)
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(slots[0].value, Some(Value::Int(7)));
    assert_eq!(vm.depth(), 0);
}

#[test]
fn float_add() {
    let v = run_float(
        "
        .func Main
            LKF f0, 2.5
            LKF f1, 0.5
            ADDF_RR f2, f0, f1
            RET 0!, f2
        .end
        ",
    );
    assert_eq!(v, 3.0);
}

#[test]
fn compare_skips_jump_when_outcome_differs() {
    let less = |lhs: &str, rhs: &str, check: &str| {
        run_int(&format!(
            "
            .func Main
                LI d0, 5
                LI d1, 3
                LT_RR {check}, {lhs}, {rhs}
                JMP taken
                RETI 0!, 1
            taken:
                RETI 0!, 2
            .end
            "
        ))
    };
    assert_eq!(less("d0", "d1", "true"), 1);
    assert_eq!(less("d1", "d0", "true"), 2);
    assert_eq!(less("d0", "d1", "false"), 2);
    assert_eq!(less("d1", "d0", "false"), 1);
}

#[test]
fn compare_against_constant() {
    let source = "
        .func Main
            LI d0, 5
            LT_RK true, d0, 3
            JMP taken
            RETI 0!, 1
        taken:
            RETI 0!, 2
        .end
    ";
    assert_eq!(run_int(source), 1);
}

#[test]
fn null_load_aborts_with_location() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
        .file \"actor.sc\"
        .line 17
            LW d0, a0, 8
            RET 0!, d0
        .end
        ",
    );
    let abort = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap_err();

    assert_eq!(abort.kind, AbortKind::ReadNil);
    assert_eq!(
        abort.origin,
        Some(Attribution::Script {
            function: "Main".to_string(),
            file: "actor.sc".to_string(),
            line: Some(17),
        })
    );
    assert!(abort.callers.is_empty());
    assert_eq!(host.reports.len(), 1);
    assert_eq!(host.reports[0], "read from nil\n  in Main at actor.sc, line 17");
    assert_eq!(vm.depth(), 0);
}

#[test]
fn null_store_aborts() {
    let abort = run_abort(
        "
        .func Main
            LI d0, 1
            SW a0, d0, 0
            RETI 0!, 0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::WriteNil);
}

#[test]
fn reports_can_be_disabled() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig {
        report_aborts: false,
        ..VmConfig::default()
    });
    load(
        &mut vm,
        &host,
        "
        .func Main
            THROW other, \"quiet\"
        .end
        ",
    );
    assert!(call(&mut vm, &mut host, "Main", &[], &[]).is_err());
    assert!(host.reports.is_empty());
}

#[test]
fn fewer_results_than_slots_leave_the_rest_untouched() {
    let (mut vm, mut host) = fresh(
        "
        .func Three
            RETI 0, 10
            RETI 1, 20
            RETI 2!, 30
        .end

        .func Main
            LI d1, -1
            LI d2, -2
            CALL_K @Three, 0, 1
            RESULT d0
            RET 0, d0
            RET 1, d1
            RET 2!, d2
        .end
        ",
    );

    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT; 3]).unwrap();
    assert_eq!(int_result(&results, 0), 10);
    assert_eq!(int_result(&results, 1), -1);
    assert_eq!(int_result(&results, 2), -2);

    let three = vm.functions().lookup("Three").unwrap();
    let mut slots = vec![ReturnSlot::new(RegType::INT); 2];
    assert_eq!(vm.call(&mut host, three, &[], &mut slots).unwrap(), 2);
    assert_eq!(slots[1].value, Some(Value::Int(20)));

    let mut slots = vec![ReturnSlot::new(RegType::INT); 4];
    slots[3].value = Some(Value::Int(99));
    assert_eq!(vm.call(&mut host, three, &[], &mut slots).unwrap(), 3);
    assert_eq!(slots[2].value, Some(Value::Int(30)));
    assert_eq!(slots[3].value, Some(Value::Int(99)));
}

#[test]
fn integer_division_by_zero_aborts() {
    for op in ["DIV_RR", "DIVU_RR", "MOD_RR", "MODU_RR"] {
        let abort = run_abort(&format!(
            "
            .func Main
                LI d0, 7
                LI d1, 0
                {op} d2, d0, d1
                RET 0!, d2
            .end
            "
        ));
        assert_eq!(abort.kind, AbortKind::DivisionByZero, "{op}");
    }

    let abort = run_abort(
        "
        .func Main
            LI d0, 7
            MOD_RK d1, d0, 0
            RET 0!, d1
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::DivisionByZero);

    let abort = run_abort(
        "
        .func Main
            LI d1, 0
            DIV_KR d0, 7, d1
            RET 0!, d0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::DivisionByZero);
}

#[test]
fn float_division_by_zero_aborts() {
    let abort = run_main(
        "
        .func Main
            LKF f0, 1.0
            LKF f1, 0.0
            DIVF_RR f2, f0, f1
            RET 0!, f2
        .end
        ",
        RegType::FLOAT,
    )
    .unwrap_err();
    assert_eq!(abort.kind, AbortKind::DivisionByZero);
}

#[test]
fn division_truncates_toward_zero() {
    let source = "
        .func Main
            LI d0, -7
            LI d1, 2
            DIV_RR d2, d0, d1
            MOD_RR d3, d0, d1
            RET 0, d2
            RET 1!, d3
        .end
    ";
    let (mut vm, mut host) = fresh(source);
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT; 2]).unwrap();
    assert_eq!(int_result(&results, 0), -3);
    assert_eq!(int_result(&results, 1), -1);
}

#[test]
fn bounds_checks() {
    let (mut vm, mut host) = fresh(
        "
        .func Check
            BOUND d0, 4
            RETI 0!, 1
        .end
        ",
    );
    let mut check = |i: i32| call(&mut vm, &mut host, "Check", &[Value::Int(i)], &[RegType::INT]);

    for i in 0..4 {
        assert_eq!(int_result(&check(i).unwrap(), 0), 1);
    }

    let abort = check(-1).unwrap_err();
    assert_eq!(abort.kind, AbortKind::NegativeIndex);
    assert_eq!(detail(&abort), "index = -1");

    let abort = check(4).unwrap_err();
    assert_eq!(abort.kind, AbortKind::IndexOutOfBounds);
    assert_eq!(detail(&abort), "max index = 3, current index = 4");
    assert_eq!(
        abort.to_string(),
        "array index too large: max index = 3, current index = 4\n  in Check at <source>, line 3"
    );
}

#[test]
fn bounds_from_register_and_constant() {
    let (mut vm, mut host) = fresh(
        "
        .func Reg
            BOUND_R d0, d1
            RETI 0!, 1
        .end

        .func Konst
            BOUND_K d0, 100000
            RETI 0!, 1
        .end
        ",
    );
    let ok = call(&mut vm, &mut host, "Reg", &[Value::Int(9), Value::Int(10)], &[RegType::INT]);
    assert!(ok.is_ok());
    let abort = call(&mut vm, &mut host, "Reg", &[Value::Int(10), Value::Int(10)], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::IndexOutOfBounds);

    assert!(call(&mut vm, &mut host, "Konst", &[Value::Int(99999)], &[]).is_ok());
    let abort = call(&mut vm, &mut host, "Konst", &[Value::Int(100000)], &[]).unwrap_err();
    assert_eq!(detail(&abort), "max index = 99999, current index = 100000");

    let abort = call(&mut vm, &mut host, "Reg", &[Value::Int(0), Value::Int(i32::MIN)], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::IndexOutOfBounds);
    assert_eq!(detail(&abort), "max index = -2147483649, current index = 0");
}

#[test]
fn int_string_round_trip() {
    let (mut vm, mut host) = fresh(
        "
        .func RoundTrip
            CAST s0, d0, I2S
            CAST d1, s0, S2I
            RET 0, d1
            RET 1!, s0
        .end
        ",
    );
    for v in [0, 1, -1, 123456, i32::MAX, i32::MIN] {
        let results = call(
            &mut vm,
            &mut host,
            "RoundTrip",
            &[Value::Int(v)],
            &[RegType::INT, RegType::STRING],
        )
        .unwrap();
        assert_eq!(int_result(&results, 0), v);
        assert_eq!(results[1], Some(Value::String(v.to_string())));
    }
}

#[test]
fn string_to_int_parses_leading_digits() {
    let (mut vm, mut host) = fresh(
        "
        .func ToInt
            CAST d0, s0, S2I
            RET 0!, d0
        .end
        ",
    );
    let mut parse = |text: &str| {
        let results = call(
            &mut vm,
            &mut host,
            "ToInt",
            &[Value::String(text.to_string())],
            &[RegType::INT],
        )
        .unwrap();
        int_result(&results, 0)
    };
    assert_eq!(parse("42abc"), 42);
    assert_eq!(parse("  -7"), -7);
    assert_eq!(parse("+3"), 3);
    assert_eq!(parse("abc"), 0);
    // Out-of-range values keep their low 32 bits.
    assert_eq!(parse("4294967297"), 1);
    assert_eq!(parse("-2147483649"), i32::MAX);
    assert_eq!(parse("99999999999999999999"), -1);
}

#[test]
fn numeric_casts_to_string() {
    let (mut vm, mut host) = fresh(
        "
        .func Unsigned
            CAST s0, d0, U2S
            RET 0!, s0
        .end

        .func Float
            CAST s0, f0, F2S
            RET 0!, s0
        .end

        .func Vector
            CAST s0, f0, V22S
            RET 0!, s0
        .end
        ",
    );
    let text = |results: Vec<Option<Value>>| match results.into_iter().next() {
        Some(Some(Value::String(s))) => s,
        other => panic!("expected a string, got {other:?}"),
    };

    let r = call(&mut vm, &mut host, "Unsigned", &[Value::Int(-1)], &[RegType::STRING]).unwrap();
    assert_eq!(text(r), "4294967295");
    let r = call(&mut vm, &mut host, "Float", &[Value::Float(1.5)], &[RegType::STRING]).unwrap();
    assert_eq!(text(r), "1.50000");
    let r = call(
        &mut vm,
        &mut host,
        "Vector",
        &[Value::Float(1.0), Value::Float(-2.0)],
        &[RegType::STRING],
    )
    .unwrap();
    assert_eq!(text(r), "(1.00000, -2.00000)");
}

#[test]
fn names_intern_through_casts() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
            LKS s0, \"Jump\"
            CAST d0, s0, S2N
            CAST s1, d0, N2S
            CAST d1, s1, S2N
            SUB_RR d2, d1, d0
            RET 0, d0
            RET 1!, d2
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT; 2]).unwrap();
    let index = int_result(&results, 0);
    assert!(index > 0);
    assert_eq!(int_result(&results, 1), 0);
    assert_eq!(host.names.get(index), Some("Jump"));
}

#[test]
fn truthiness_casts() {
    let v = run_int(
        "
        .func Main
            LI d0, 3
            CASTB d1, d0, I2B
            LKS s0, \"\"
            CASTB d2, s0, S2B
            CASTB d3, a0, A2B
            ADD_RR d4, d1, d2
            ADD_RR d4, d4, d3
            RET 0!, d4
        .end
        ",
    );
    assert_eq!(v, 1);
}

#[test]
fn dynamic_cast_checks_the_class_chain() {
    let mut host = StandaloneHost::new();
    let actor = host.heap.classes.define("Actor", None, 0, vec![]);
    let pawn = host.heap.classes.define("Pawn", Some(actor), 0, vec![]);
    let item = host.heap.classes.define("Item", None, 0, vec![]);
    let mut vm = Vm::new(VmConfig::default());
    load(
        &mut vm,
        &host,
        "
        .func ToPawn
            DYNCAST_K a1, a0, %Pawn
            RET 0!, a1
        .end

        .func ToActor
            DYNCAST_K a1, a0, %Actor
            RET 0!, a1
        .end
        ",
    );

    let pawn_obj = Pointer::Object(host.heap.new_object(pawn).unwrap());
    let actor_obj = Pointer::Object(host.heap.new_object(actor).unwrap());
    let item_obj = Pointer::Object(host.heap.new_object(item).unwrap());

    let mut cast = |name: &str, p: Pointer| {
        call(&mut vm, &mut host, name, &[Value::Pointer(p)], &[RegType::POINTER])
            .map(|mut r| r.remove(0))
    };
    assert_eq!(cast("ToPawn", pawn_obj).unwrap(), Some(Value::Pointer(pawn_obj)));
    assert_eq!(cast("ToActor", pawn_obj).unwrap(), Some(Value::Pointer(pawn_obj)));
    assert_eq!(cast("ToPawn", actor_obj).unwrap(), Some(Value::Pointer(Pointer::Null)));
    assert_eq!(cast("ToPawn", item_obj).unwrap(), Some(Value::Pointer(Pointer::Null)));
    assert_eq!(cast("ToPawn", Pointer::Null).unwrap(), Some(Value::Pointer(Pointer::Null)));

    let abort = cast("ToPawn", Pointer::Class(pawn)).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
}

#[test]
fn class_cast_checks_the_class_chain() {
    let mut host = StandaloneHost::new();
    let actor = host.heap.classes.define("Actor", None, 0, vec![]);
    let pawn = host.heap.classes.define("Pawn", Some(actor), 0, vec![]);
    let item = host.heap.classes.define("Item", None, 0, vec![]);
    let mut vm = Vm::new(VmConfig::default());
    load(
        &mut vm,
        &host,
        "
        .func ToActor
            DYNCASTC_K a1, a0, %Actor
            RET 0!, a1
        .end

        .func ToClass
            DYNCASTC_R a2, a0, a1
            RET 0!, a2
        .end
        ",
    );

    let obj = Pointer::Object(host.heap.new_object(pawn).unwrap());

    let mut cast = |name: &str, args: &[Pointer]| {
        let args: Vec<Value> = args.iter().copied().map(Value::Pointer).collect();
        call(&mut vm, &mut host, name, &args, &[RegType::POINTER]).map(|mut r| r.remove(0))
    };
    let class = Pointer::Class;
    let null = Some(Value::Pointer(Pointer::Null));

    assert_eq!(cast("ToActor", &[class(pawn)]).unwrap(), Some(Value::Pointer(class(pawn))));
    assert_eq!(cast("ToActor", &[class(actor)]).unwrap(), Some(Value::Pointer(class(actor))));
    assert_eq!(cast("ToActor", &[class(item)]).unwrap(), null);
    assert_eq!(cast("ToActor", &[Pointer::Null]).unwrap(), null);
    assert_eq!(cast("ToClass", &[class(pawn), class(actor)]).unwrap(), Some(Value::Pointer(class(pawn))));
    assert_eq!(cast("ToClass", &[class(actor), class(pawn)]).unwrap(), null);

    let abort = cast("ToActor", &[obj]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
}

#[test]
fn class_of_object() {
    let mut host = StandaloneHost::new();
    let pawn = host.heap.classes.define("Pawn", None, 0, vec![]);
    let item = host.heap.classes.define("Item", None, 0, vec![]);
    let mut vm = Vm::new(VmConfig::default());
    load(
        &mut vm,
        &host,
        "
        .func IsPawn
            CLSS a1, a0
            EQA_K true, a1, %Pawn
            JMP yes
            RETI 0!, 0
        yes:
            RETI 0!, 1
        .end
        ",
    );
    let pawn_obj = Pointer::Object(host.heap.new_object(pawn).unwrap());
    let item_obj = Pointer::Object(host.heap.new_object(item).unwrap());

    let r = call(&mut vm, &mut host, "IsPawn", &[Value::Pointer(pawn_obj)], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&r, 0), 1);
    let r = call(&mut vm, &mut host, "IsPawn", &[Value::Pointer(item_obj)], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&r, 0), 0);
    let abort = call(&mut vm, &mut host, "IsPawn", &[Value::Pointer(Pointer::Null)], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ReadNil);
}

#[test]
fn object_stores_notify_the_barrier_once() {
    let mut host = StandaloneHost::new();
    let holder_class = host.heap.classes.define("Holder", None, 16, vec![]);
    let mut vm = Vm::new(VmConfig::default());
    load(
        &mut vm,
        &host,
        "
        .func Store
            SO a0, a1, 0
            SO a0, a2, 8
            RETI 0!, 0
        .end

        .func StorePlain
            SP a0, a1, 0
            RETI 0!, 0
        .end
        ",
    );
    let holder = host.heap.new_object(holder_class).unwrap();
    let other = host.heap.new_object(holder_class).unwrap();
    let args = [
        Value::Pointer(Pointer::Object(holder)),
        Value::Pointer(Pointer::Object(other)),
    ];

    call(&mut vm, &mut host, "Store", &args, &[]).unwrap();
    assert_eq!(host.barriers, 2);
    let base = host.heap.object_address(holder).unwrap();
    assert_eq!(host.heap.read_pointer(base).unwrap(), Pointer::Object(other));
    let second = Address { offset: 8, ..base };
    assert_eq!(host.heap.read_pointer(second).unwrap(), Pointer::Null);

    call(&mut vm, &mut host, "StorePlain", &args, &[]).unwrap();
    assert_eq!(host.barriers, 2);

    let bad = [
        Value::Pointer(Pointer::Object(holder)),
        Value::Pointer(Pointer::Class(holder_class)),
    ];
    let abort = call(&mut vm, &mut host, "Store", &bad, &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert_eq!(host.barriers, 2);
}

fn native_reenter(
    vm: &mut Vm,
    host: &mut dyn Host,
    _args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    vm.call_by_name(host, "Fail", &[], &mut [])
}

#[test]
fn abort_through_native_is_attributed_to_every_frame() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("Reenter", native_reenter);
    load(
        &mut vm,
        &host,
        "
        .func Fail
        .line 5
            THROW other, \"gave up\"
        .end

        .func Main
        .line 9
            CALL_K @Reenter, 0, 0
            RETI 0!, 0
        .end
        ",
    );

    let abort = call(&mut vm, &mut host, "Main", &[], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::Other);
    assert_eq!(detail(&abort), "gave up");
    assert_eq!(
        abort.origin,
        Some(Attribution::Script {
            function: "Fail".to_string(),
            file: "<source>".to_string(),
            line: Some(5),
        })
    );
    assert_eq!(
        abort.callers,
        vec![
            Attribution::native("Reenter"),
            Attribution::Script {
                function: "Main".to_string(),
                file: "<source>".to_string(),
                line: Some(9),
            },
        ]
    );
    assert_eq!(host.reports.len(), 1);
    assert_eq!(
        host.reports[0],
        "script aborted: gave up\n  in Fail at <source>, line 5\n  called from native Reenter\n  called from Main at <source>, line 9"
    );
    assert_eq!(vm.depth(), 0);
}

#[test]
fn throw_without_message() {
    let abort = run_abort(
        "
        .func Main
            THROW bad_self, \"\"
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::BadSelf);
    assert_eq!(abort.detail, None);
}

#[test]
fn runaway_recursion_aborts() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig {
        max_call_depth: 16,
        ..VmConfig::default()
    });
    load(
        &mut vm,
        &host,
        "
        .func Recurse
            CALL_K @Recurse, 0, 0
            RETI 0!, 0
        .end

        .func Fine
            RETI 0!, 5
        .end
        ",
    );

    let abort = call(&mut vm, &mut host, "Recurse", &[], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::Other);
    assert_eq!(detail(&abort), "call stack overflow");
    assert_eq!(abort.callers.len(), 15);
    assert_eq!(vm.depth(), 0);

    let results = call(&mut vm, &mut host, "Fine", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 5);
}

#[test]
fn by_reference_parameter_is_written_back() {
    let (mut vm, mut host) = fresh(
        "
        .func Bump
            LW d0, a0, 0
            ADDI d0, d0, 5
            SW a0, d0, 0
            RETI 0!, 0
        .end

        .func Main
            LI d0, 10
            PARAM &d0
            CALL_K @Bump, 1, 0
            RET 0!, d0
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 15);
    assert_eq!(host.heap.live_blocks(), 0);
}

fn native_double(
    _vm: &mut Vm,
    host: &mut dyn Host,
    args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let Some(Pointer::Addr(cell)) = args.first().and_then(Value::as_pointer) else {
        return Err(ScriptAbort::new(AbortKind::BadSelf));
    };
    let v = i32::from_le_bytes(host.heap().read_bytes(cell)?);
    host.heap_mut().write_bytes(cell, &(v * 2).to_le_bytes())?;
    Ok(0)
}

#[test]
fn by_reference_parameter_to_native() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("Double", native_double);
    load(
        &mut vm,
        &host,
        "
        .func Main
            LI d0, 21
            PARAM &d0
            CALL_K @Double, 1, 0
            RET 0!, d0
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 42);
    assert_eq!(host.heap.live_blocks(), 0);
}

#[test]
fn by_reference_cells_are_freed_on_abort() {
    let (mut vm, mut host) = fresh(
        "
        .func Explode
            MOVA a0, a1
            THROW other, \"boom\"
        .end

        .func Main
            LI d0, 1
            LKS s0, \"text\"
            PARAM &d0
            PARAM &s0
            CALL_K @Explode, 2, 0
            RETI 0!, 0
        .end
        ",
    );
    let abort = call(&mut vm, &mut host, "Main", &[], &[]).unwrap_err();
    assert_eq!(detail(&abort), "boom");
    assert_eq!(host.heap.live_blocks(), 0);
}

#[test]
fn frame_extra_space() {
    let source = "
        .func Main
        .extra 16
            LFP a0
            LI d0, 42
            SW a0, d0, 4
            LW d1, a0, 4
            RET 0!, d1
        .end
    ";
    let (mut vm, mut host) = fresh(source);
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 42);
    assert_eq!(host.heap.live_blocks(), 0);

    let abort = run_abort(
        "
        .func Main
            LFP a0
            LW d0, a0, 0
            RET 0!, d0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::ReadNil);
}

#[test]
fn loads_and_stores_through_frame_memory() {
    let v = run_int(
        "
        .func Main
        .extra 32
            LFP a0
            LI d0, 255
            SB a0, d0, 0
            LB d1, a0, 0
            LBU d2, a0, 0
            ADD_RR d3, d1, d2
            LKS s0, \"kept\"
            SS a0, s0, 8
            LS s1, a0, 8
            LENS d4, s1
            ADD_RR d3, d3, d4
            ADDA_RK a1, a0, 16
            SUBA d5, a1, a0
            ADD_RR d3, d3, d5
            RET 0!, d3
        .end
        ",
    );
    assert_eq!(v, 254 + 4 + 16);
}

#[test]
fn halfword_loads_extend_by_signedness() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
        .extra 8
            LFP a0
            LI d0, -2
            SH a0, d0, 2
            LH d1, a0, 2
            LHU d2, a0, 2
            RET 0, d1
            RET 1!, d2
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT, RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), -2);
    assert_eq!(int_result(&results, 1), 65534);
}

#[test]
fn bit_flags_in_memory() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
        .extra 8
            LFP a0
            LI d0, 1
            SBIT a0, d0, 5
            LBU d1, a0, 0
            LI d0, 0
            SBIT a0, d0, 4
            LBU d2, a0, 0
            LBIT d3, a0, 1
            LBIT d4, a0, 4
            RET 0, d1
            RET 1, d2
            RET 2, d3
            RET 3!, d4
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT; 4]).unwrap();
    assert_eq!(int_result(&results, 0), 5);
    assert_eq!(int_result(&results, 1), 1);
    assert_eq!(int_result(&results, 2), 1);
    assert_eq!(int_result(&results, 3), 0);
}

#[test]
fn single_precision_round_trip_narrows() {
    let v = run_float(
        "
        .func Main
        .extra 8
            LFP a0
            LKF f0, 0.1
            SSP a0, f0, 4
            LSP f1, a0, 4
            RET 0!, f1
        .end
        ",
    );
    assert_eq!(v, 0.1f32 as f64);
    assert_ne!(v, 0.1);
}

#[test]
fn c_string_through_stored_pointer() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
        .extra 24
            LFP a0
            LI d0, 104
            SB a0, d0, 16
            LI d0, 105
            SB a0, d0, 17
            ADDA_RK a1, a0, 16
            SP a0, a1, 0
            LCS s0, a0, 0
            LCS s1, a0, 8
            RET 0, s0
            RET 1!, s1
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::STRING, RegType::STRING]).unwrap();
    assert_eq!(results[0], Some(Value::String("hi".into())));
    assert_eq!(results[1], Some(Value::String(String::new())));
}

#[test]
fn vectors_through_memory() {
    let v = run_float(
        "
        .func Main
        .extra 48
            LFP a0
            LKF f0, 1.0
            LKF f1, 2.0
            LKF f2, 3.0
            SV3 a0, f0, 0
            LV3 f3, a0, 0
            SV2 a0, f1, 24
            LV2 f6, a0, 24
            ADDF_RR f8, f3, f4
            ADDF_RR f8, f8, f5
            ADDF_RR f8, f8, f6
            ADDF_RR f8, f8, f7
            RET 0!, f8
        .end
        ",
    );
    assert_eq!(v, 1.0 + 2.0 + 3.0 + 2.0 + 3.0);
}

#[test]
fn out_of_block_access_is_a_contract_violation() {
    let abort = run_abort(
        "
        .func Main
        .extra 4
            LFP a0
            LW d0, a0, 4
            RET 0!, d0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::ContractViolation);
}

#[test]
fn reload_replaces_function_in_place() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    let first = load(&mut vm, &host, ".func Value\nRETI 0!, 1\n.end\n");
    let results = call(&mut vm, &mut host, "Value", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 1);

    let second = load(&mut vm, &host, ".func value\nRETI 0!, 2\n.end\n");
    assert_eq!(first, second);
    let results = call(&mut vm, &mut host, "Value", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 2);
}

fn native_reload(
    vm: &mut Vm,
    host: &mut dyn Host,
    _args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let module = assemble_source(".func Main\nRETI 0!, 2\n.end\n")?;
    vm.load_module(&*host, &module)?;
    Ok(0)
}

#[test]
fn running_frame_keeps_its_code_across_reload() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("Reload", native_reload);
    load(
        &mut vm,
        &host,
        "
        .func Main
            CALL_K @Reload, 0, 0
            RETI 0!, 1
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 1);
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 2);
}

#[test]
fn compare_must_be_followed_by_jump() {
    let abort = run_abort(
        "
        .func Main
            LI d0, 1
            EQ_R true, d0, d0
            NOP
            RETI 0!, 0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert!(detail(&abort).contains("must be JMP"));
}

#[test]
fn executed_result_marker_is_a_contract_violation() {
    let abort = run_abort(
        "
        .func Main
            RESULT d0
            RETI 0!, 0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert!(detail(&abort).contains("RESULT marker"));
}

#[test]
fn staging_beyond_declared_capacity() {
    let abort = run_abort(
        "
        .func Main
        .maxparam 1
            PARAMI 1
            PARAMI 2
            CALL_K @Main, 2, 0
            RETI 0!, 0
        .end
        ",
    );
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert_eq!(detail(&abort), "parameter staging overflow (1 slots declared)");
}

#[test]
fn vector_parameters_stage_each_component() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("SumF", native_sum_floats);
    load(
        &mut vm,
        &host,
        "
        .func Main
            LKF f0, 1.5
            LKF f1, 2.0
            PARAM v2:f0
            PARAM 0.25
            CALL_K @SumF, 3, 1
            RESULT f2
            RET 0!, f2
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::FLOAT]).unwrap();
    assert_eq!(results[0], Some(Value::Float(3.75)));
}

fn native_wrong_type(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _args: &[Value],
    results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    if let Some(slot) = results.first_mut() {
        slot.value = Some(Value::String("oops".to_string()));
    }
    Ok(1)
}

#[test]
fn result_of_the_wrong_type_is_rejected() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("Wrong", native_wrong_type);
    load(
        &mut vm,
        &host,
        "
        .func Main
            CALL_K @Wrong, 0, 1
            RESULT d0
            RET 0!, d0
        .end
        ",
    );
    let abort = call(&mut vm, &mut host, "Main", &[], &[RegType::INT]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert_eq!(detail(&abort), "return slot 0 expects int, got string");
}

#[test]
fn virtual_dispatch() {
    let mut host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    load(
        &mut vm,
        &host,
        "
        .func Hello
            RETI 0!, 77
        .end

        .func Dispatch
            VTBL a1, a0, 0
            CALL a1, 0, 1
            RESULT d0
            RET 0!, d0
        .end

        .func Missing
            VTBL a1, a0, 1
            RETI 0!, 0
        .end
        ",
    );
    let hello = vm.functions().lookup("Hello").unwrap();
    let greeter = host.heap.classes.define("Greeter", None, 0, vec![hello]);
    let obj = Value::Pointer(Pointer::Object(host.heap.new_object(greeter).unwrap()));

    let results = call(&mut vm, &mut host, "Dispatch", &[obj.clone()], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 77);

    let abort = call(&mut vm, &mut host, "Missing", &[obj], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
}

#[test]
fn string_operations() {
    let compare = |flags: &str| {
        run_int(&format!(
            "
            .func Main
                LKS s0, \"Hello\"
                LKS s1, \"HELLO\"
                CMPS {flags}, s0, s1
                JMP same
                RETI 0!, 0
            same:
                CONCAT s2, s0, s1
                LENS d0, s2
                RET 0!, d0
            .end
            "
        ))
    };
    assert_eq!(compare("true~"), 10);
    assert_eq!(compare("true"), 0);
    assert_eq!(compare("lt:true"), 0);
    assert_eq!(compare("lt:false"), 10);
}

#[test]
fn approximate_float_compare() {
    let compare = |flags: &str| {
        run_int(&format!(
            "
            .func Main
                LKF f0, 1.000001
                EQF_K {flags}, f0, 1.0
                JMP equal
                RETI 0!, 0
            equal:
                RETI 0!, 1
            .end
            "
        ))
    };
    assert_eq!(compare("true~"), 1);
    assert_eq!(compare("true"), 0);
}

#[test]
fn vector_math() {
    let cross = run_float(
        "
        .func Main
            LKF f0, 1.0
            LKF f1, 0.0
            LKF f4, 1.0
            MOVF f2, f1
            MOVF f3, f1
            MOVF f5, f1
            CROSSV_RR f6, f0, f3
            RET 0!, f8
        .end
        ",
    );
    assert_eq!(cross, 1.0);

    let length = run_float(
        "
        .func Main
            LKF f0, 2.0
            LKF f1, 3.0
            LKF f2, 6.0
            LENV3 f3, f0
            RET 0!, f3
        .end
        ",
    );
    assert_eq!(length, 7.0);
}

#[test]
fn atan2_is_in_degrees() {
    let v = run_float(
        "
        .func Main
            LKF f0, 1.0
            LKF f1, 1.0
            ATAN2 f2, f0, f1
            RET 0!, f2
        .end
        ",
    );
    assert!((v - 45.0).abs() < 1e-9);
}

#[test]
fn jump_table() {
    let (mut vm, mut host) = fresh(
        "
        .func Pick
            IJMP d0, 0
            JMP case0
            JMP case1
            JMP case2
        case0:
            RETI 0!, 100
        case1:
            RETI 0!, 101
        case2:
            RETI 0!, 102
        .end
        ",
    );
    for i in 0..3 {
        let results = call(&mut vm, &mut host, "Pick", &[Value::Int(i)], &[RegType::INT]).unwrap();
        assert_eq!(int_result(&results, 0), 100 + i);
    }
}

#[test]
fn test_instruction_branches_on_equality() {
    let (mut vm, mut host) = fresh(
        "
        .func IsSeven
            TEST d0, 7
            JMP yes
            RETI 0!, 0
        yes:
            RETI 0!, 1
        .end
        ",
    );
    let mut check = |v: i32| {
        let results = call(&mut vm, &mut host, "IsSeven", &[Value::Int(v)], &[RegType::INT]).unwrap();
        int_result(&results, 0)
    };
    assert_eq!(check(7), 1);
    assert_eq!(check(8), 0);
}

#[test]
fn bit_operations() {
    let v = run_int(
        "
        .func Main
            LI d0, 255
            SEXT d1, d0, 8
            LI d2, 3
            SLL_RI d3, d2, 33
            ADD_RR d4, d1, d3
            RET 0!, d4
        .end
        ",
    );
    assert_eq!(v, -1 + 6);
}

#[test]
fn right_shifts() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
            LI d0, -16
            LI d1, 4
            SRL_RI d2, d0, 28
            SRA_RI d3, d0, 2
            SRA_RR d4, d0, d1
            SRL_KR d5, 256, d1
            RET 0, d2
            RET 1, d3
            RET 2, d4
            RET 3!, d5
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::INT; 4]).unwrap();
    assert_eq!(int_result(&results, 0), 15);
    assert_eq!(int_result(&results, 1), -4);
    assert_eq!(int_result(&results, 2), -1);
    assert_eq!(int_result(&results, 3), 16);
}

#[test]
fn float_functions() {
    let (mut vm, mut host) = fresh(
        "
        .func Main
            LKF f0, 16.0
            LKF f1, -2.5
            LKF f2, 90.0
            FLOP f3, f0, sqrt
            FLOP f4, f1, abs
            FLOP f5, f1, floor
            FLOP f6, f1, round
            FLOP f7, f2, sin_deg
            RET 0, f3
            RET 1, f4
            RET 2, f5
            RET 3, f6
            RET 4!, f7
        .end
        ",
    );
    let results = call(&mut vm, &mut host, "Main", &[], &[RegType::FLOAT; 5]).unwrap();
    let float = |slot: usize| results[slot].as_ref().and_then(Value::as_float).unwrap();
    assert_eq!(float(0), 4.0);
    assert_eq!(float(1), 2.5);
    assert_eq!(float(2), -3.0);
    assert_eq!(float(3), -3.0);
    assert!((float(4) - 1.0).abs() < 1e-12);
}

#[test]
fn unsigned_compare() {
    let v = run_int(
        "
        .func Main
            LI d0, -1
            LI d1, 1
            LTU_RR true, d1, d0
            JMP yes
            RETI 0!, 0
        yes:
            RETI 0!, 1
        .end
        ",
    );
    assert_eq!(v, 1);
}

#[test]
fn script_to_script_call_with_arguments() {
    let v = run_int(
        "
        .func Sub
            SUB_RR d2, d0, d1
            RET 0!, d2
        .end

        .func Main
            LI d0, 50
            PARAM d0
            PARAMI 8
            CALL_K @Sub, 2, 1
            RESULT d1
            RET 0!, d1
        .end
        ",
    );
    assert_eq!(v, 42);
}

fn single(word: Word, num_int: u16) -> (Vm, StandaloneHost) {
    let mut function = CompiledFunction::new("Bad", "bad.sc");
    function.layout.num_int = num_int;
    function.code = vec![word.0];
    let module = Module {
        functions: vec![function],
    };
    let host = StandaloneHost::new();
    let mut vm = Vm::new(VmConfig::default());
    vm.load_module(&host, &module).unwrap();
    (vm, host)
}

#[test]
fn malformed_code_is_a_contract_violation() {
    let mov = Word::new(Instruction::Mov)
        .with_unsigned(Field::A, 0)
        .unwrap()
        .with_unsigned(Field::B, 5)
        .unwrap();
    let (mut vm, mut host) = single(mov, 1);
    let abort = call(&mut vm, &mut host, "Bad", &[], &[]).unwrap_err();
    assert_eq!(abort.kind, AbortKind::ContractViolation);
    assert_eq!(detail(&abort), "int register 5 out of range (1 declared)");

    let (mut vm, mut host) = single(Word(0xFF), 0);
    let abort = call(&mut vm, &mut host, "Bad", &[], &[]).unwrap_err();
    assert_eq!(detail(&abort), "invalid opcode 0xff at instruction 0");

    let (mut vm, mut host) = single(Word::new(Instruction::Nop), 0);
    let abort = call(&mut vm, &mut host, "Bad", &[], &[]).unwrap_err();
    assert_eq!(detail(&abort), "execution ran past the end of Bad");
    assert_eq!(
        abort.origin.as_ref().map(Attribution::function),
        Some("Bad")
    );
}

#[test]
fn garbage_collection_keeps_extra_roots() {
    let (vm, mut host) = fresh(".func Main\nRETI 0!, 0\n.end\n");
    let class = host.heap.classes.define("Thing", None, 8, vec![]);
    let kept = host.heap.new_object(class).unwrap();
    host.heap.new_object(class).unwrap();
    host.heap.new_object(class).unwrap();

    let freed = vm.collect_garbage(&mut host, [Pointer::Object(kept)]);
    assert_eq!(freed, 2);
    assert_eq!(host.heap.live_objects(), 1);
}

fn native_collect(
    vm: &mut Vm,
    host: &mut dyn Host,
    _args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    vm.collect_garbage(host, std::iter::empty());
    Ok(0)
}

#[test]
fn pending_by_reference_cells_are_roots() {
    let mut host = StandaloneHost::new();
    let class = host.heap.classes.define("Thing", None, 8, vec![]);
    let obj = Pointer::Object(host.heap.new_object(class).unwrap());
    let mut vm = Vm::new(VmConfig::default());
    vm.functions_mut().register_native("Collect", native_collect);
    load(
        &mut vm,
        &host,
        "
        .func Forget
            LKP a0, null
            CALL_K @Collect, 0, 0
            RETI 0!, 0
        .end

        .func Main
            PARAM &a0
            LKP a0, null
            CALL_K @Forget, 1, 0
            RET 0!, a0
        .end
        ",
    );

    let results = call(&mut vm, &mut host, "Main", &[Value::Pointer(obj)], &[RegType::POINTER]).unwrap();
    assert_eq!(results[0], Some(Value::Pointer(obj)));
    assert_eq!(host.heap.live_objects(), 1);
    assert_eq!(host.heap.live_blocks(), 1);
}

fn native_reload_and_collect(
    vm: &mut Vm,
    host: &mut dyn Host,
    _args: &[Value],
    _results: &mut [ReturnSlot],
) -> Result<usize, ScriptAbort> {
    let module = assemble_source(".func Holder\nRETI 0!, 0\n.end\n")?;
    vm.load_module(&*host, &module)?;
    vm.collect_garbage(host, std::iter::empty());
    Ok(0)
}

#[test]
fn replaced_code_keeps_its_pointer_pool_alive() {
    let mut host = StandaloneHost::new();
    let class = host.heap.classes.define("Thing", None, 8, vec![]);
    let obj = host.heap.new_object(class).unwrap();
    let storage = host.heap.object_address(obj).unwrap();
    host.heap.write_bytes(storage, &7i32.to_le_bytes()).unwrap();

    let mut vm = Vm::new(VmConfig::default());
    let collect = vm
        .functions_mut()
        .register_native("ReloadAndCollect", native_reload_and_collect);
    let module = assemble_source(
        "
        .func Holder
            CALL_K @ReloadAndCollect, 0, 0
            LKP a0, null
            LW d0, a0, 0
            RET 0!, d0
        .end
        ",
    )
    .unwrap();
    let holder = ScriptFunction::link(&module.functions[0], |symbol| match symbol {
        Symbol::Function(_) => Ok(Pointer::Function(collect)),
        _ => Ok(Pointer::Object(obj)),
    })
    .unwrap();
    vm.functions_mut().register_script(holder);

    let results = call(&mut vm, &mut host, "Holder", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 7);
    assert_eq!(host.heap.live_objects(), 1);

    let results = call(&mut vm, &mut host, "Holder", &[], &[RegType::INT]).unwrap();
    assert_eq!(int_result(&results, 0), 0);
}
