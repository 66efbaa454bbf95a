// Integration tests for the depyc decompiler
//
// These tests assemble synthetic code objects the way CPython's compiler
// would emit them and check the decompiled source text. Covered:
// - Expressions, assignments, and chained stores
// - Control flow (if/else, ternaries, for/while loops, try/except)
// - Functions, classes, lambdas, comprehensions
// - Imports, f-strings, py2 print statements

use depyc::code::{CodeFlags, CodeObject, Object};
use depyc::engine::Decompiler;
use depyc::printer::print_source;
use depyc::version::PythonVersion;
use pretty_assertions::assert_eq;

/// Assemble 3.6+ wordcode: one (opcode, operand) byte pair per entry.
fn wordcode(ops: &[(u8, u8)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ops.len() * 2);
    for &(op, arg) in ops {
        out.push(op);
        out.push(arg);
    }
    out
}

/// Assemble pre-3.6 bytecode: three bytes with an operand, one without.
fn legacy_code(ops: &[(u8, Option<u16>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(op, arg) in ops {
        out.push(op);
        if let Some(arg) = arg {
            out.extend_from_slice(&arg.to_le_bytes());
        }
    }
    out
}

fn module(code: Vec<u8>, consts: Vec<Object>, names: &[&str]) -> CodeObject {
    let mut module = CodeObject::empty();
    module.name = "<module>".to_string();
    module.filename = "test.py".to_string();
    module.stacksize = 16;
    module.code = code;
    module.consts = consts;
    module.names = names.iter().map(|n| n.to_string()).collect();
    module
}

fn function(
    name: &str,
    code: Vec<u8>,
    consts: Vec<Object>,
    varnames: &[&str],
    argcount: u32,
) -> CodeObject {
    let mut func = CodeObject::empty();
    func.name = name.to_string();
    func.filename = "test.py".to_string();
    func.stacksize = 16;
    func.argcount = argcount;
    func.nlocals = varnames.len() as u32;
    func.flags = CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS;
    func.code = code;
    func.consts = consts;
    func.varnames = varnames.iter().map(|n| n.to_string()).collect();
    func
}

fn decompile(version: PythonVersion, code: &CodeObject) -> String {
    let mut decompiler = Decompiler::new(version);
    let root = decompiler.decompile_module(code).expect("decompile failed");
    print_source(&root, version, decompiler.clean_build)
}

fn py38() -> PythonVersion {
    PythonVersion::new(3, 8)
}

fn py27() -> PythonVersion {
    PythonVersion::new(2, 7)
}

fn s(text: &str) -> Object {
    Object::Str(text.to_string())
}

#[test]
fn test_function_returning_sum() {
    // def f(): return 1 + 2
    let f = function(
        "f",
        wordcode(&[(100, 1), (100, 2), (23, 0), (83, 0)]),
        vec![Object::None, Object::Int(1), Object::Int(2)],
        &[],
        0,
    );
    let main = module(
        wordcode(&[(100, 0), (100, 1), (132, 0), (90, 0), (100, 2), (83, 0)]),
        vec![Object::Code(Box::new(f)), s("f"), Object::None],
        &["f"],
    );
    assert_eq!(decompile(py38(), &main), "def f():\n    return 1 + 2\n");
}

#[test]
fn test_if_else_statement() {
    // if a: b = 1
    // else: b = 2
    let main = module(
        wordcode(&[
            (101, 0), // LOAD_NAME a
            (114, 10), // POP_JUMP_IF_FALSE -> 10
            (100, 1), // LOAD_CONST 1
            (90, 1),  // STORE_NAME b
            (110, 4), // JUMP_FORWARD -> 14
            (100, 2), // LOAD_CONST 2
            (90, 1),  // STORE_NAME b
            (100, 0), // LOAD_CONST None
            (83, 0),  // RETURN_VALUE
        ]),
        vec![Object::None, Object::Int(1), Object::Int(2)],
        &["a", "b"],
    );
    assert_eq!(
        decompile(py38(), &main),
        "if a:\n    b = 1\nelse:\n    b = 2\n"
    );
}

#[test]
fn test_ternary_recovery() {
    // b = 1 if a else 2
    let main = module(
        wordcode(&[
            (101, 0), // LOAD_NAME a
            (114, 8), // POP_JUMP_IF_FALSE -> 8
            (100, 1), // LOAD_CONST 1
            (110, 2), // JUMP_FORWARD -> 10
            (100, 2), // LOAD_CONST 2
            (90, 1),  // STORE_NAME b
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, Object::Int(1), Object::Int(2)],
        &["a", "b"],
    );
    assert_eq!(decompile(py38(), &main), "b = 1 if a else 2\n");
}

#[test]
fn test_const_key_map() {
    // d = {'x': 1, 'y': 2}
    let main = module(
        wordcode(&[(100, 1), (100, 2), (100, 3), (156, 2), (90, 0), (100, 0), (83, 0)]),
        vec![
            Object::None,
            Object::Int(1),
            Object::Int(2),
            Object::Tuple(vec![s("x"), s("y")]),
        ],
        &["d"],
    );
    assert_eq!(decompile(py38(), &main), "d = {'x': 1, 'y': 2}\n");
}

#[test]
fn test_class_definition() {
    // class C: pass
    let mut body = function(
        "C",
        wordcode(&[(101, 0), (90, 1), (100, 0), (90, 2), (100, 1), (83, 0)]),
        vec![s("C"), Object::None],
        &[],
        0,
    );
    body.names = vec![
        "__name__".to_string(),
        "__module__".to_string(),
        "__qualname__".to_string(),
    ];
    let main = module(
        wordcode(&[
            (71, 0),  // LOAD_BUILD_CLASS
            (100, 1), // LOAD_CONST <code C>
            (100, 2), // LOAD_CONST 'C'
            (132, 0), // MAKE_FUNCTION
            (100, 2), // LOAD_CONST 'C'
            (131, 2), // CALL_FUNCTION 2
            (90, 0),  // STORE_NAME C
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, Object::Code(Box::new(body)), s("C")],
        &["C"],
    );
    assert_eq!(decompile(py38(), &main), "class C:\n    pass\n");
}

#[test]
fn test_kw_names_call_311() {
    // f(1, k=2)
    let main = module(
        wordcode(&[
            (151, 0), // RESUME
            (2, 0),   // PUSH_NULL
            (101, 0), // LOAD_NAME f
            (100, 1), // LOAD_CONST 1
            (100, 2), // LOAD_CONST 2
            (172, 3), // KW_NAMES ('k',)
            (166, 2), // PRECALL 2
            (171, 2), // CALL 2
            (1, 0),   // POP_TOP
            (100, 0),
            (83, 0),
        ]),
        vec![
            Object::None,
            Object::Int(1),
            Object::Int(2),
            Object::Tuple(vec![s("k")]),
        ],
        &["f"],
    );
    assert_eq!(decompile(PythonVersion::new(3, 11), &main), "f(1, k=2)\n");
}

#[test]
fn test_for_loop() {
    // for x in y: f(x)
    let main = module(
        wordcode(&[
            (101, 0),  // LOAD_NAME y
            (68, 0),   // GET_ITER
            (93, 12),  // FOR_ITER -> 18
            (90, 1),   // STORE_NAME x
            (101, 2),  // LOAD_NAME f
            (101, 1),  // LOAD_NAME x
            (131, 1),  // CALL_FUNCTION 1
            (1, 0),    // POP_TOP
            (113, 4),  // JUMP_ABSOLUTE -> 4
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["y", "x", "f"],
    );
    assert_eq!(decompile(py38(), &main), "for x in y:\n    f(x)\n");
}

#[test]
fn test_while_loop() {
    // while a: f()
    let main = module(
        wordcode(&[
            (101, 0),  // LOAD_NAME a
            (114, 12), // POP_JUMP_IF_FALSE -> 12
            (101, 1),  // LOAD_NAME f
            (131, 0),  // CALL_FUNCTION 0
            (1, 0),    // POP_TOP
            (113, 0),  // JUMP_ABSOLUTE -> 0
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["a", "f"],
    );
    assert_eq!(decompile(py38(), &main), "while a:\n    f()\n");
}

#[test]
fn test_while_true_loop() {
    let main = module(
        wordcode(&[
            (101, 0), // LOAD_NAME f
            (131, 0), // CALL_FUNCTION 0
            (1, 0),   // POP_TOP
            (113, 0), // JUMP_ABSOLUTE -> 0
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["f"],
    );
    assert_eq!(decompile(py38(), &main), "while True:\n    f()\n");
}

#[test]
fn test_try_bare_except() {
    // try: f()
    // except: g()
    let main = module(
        wordcode(&[
            (122, 10), // SETUP_FINALLY -> 12
            (101, 0),  // LOAD_NAME f
            (131, 0),
            (1, 0),
            (87, 0),   // POP_BLOCK
            (110, 14), // JUMP_FORWARD -> 26
            (1, 0),    // POP_TOP x3 (exception triple)
            (1, 0),
            (1, 0),
            (101, 1),  // LOAD_NAME g
            (131, 0),
            (1, 0),
            (89, 0),   // POP_EXCEPT
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["f", "g"],
    );
    assert_eq!(
        decompile(py38(), &main),
        "try:\n    f()\nexcept:\n    g()\n"
    );
}

#[test]
fn test_try_typed_except() {
    // try: f()
    // except E: g()
    let main = module(
        wordcode(&[
            (122, 10), // SETUP_FINALLY -> 12
            (101, 0),  // LOAD_NAME f
            (131, 0),
            (1, 0),
            (87, 0),   // POP_BLOCK
            (110, 26), // JUMP_FORWARD -> 38
            (4, 0),    // DUP_TOP
            (101, 1),  // LOAD_NAME E
            (107, 10), // COMPARE_OP exception-match
            (114, 36), // POP_JUMP_IF_FALSE -> 36
            (1, 0),
            (1, 0),
            (1, 0),
            (101, 2),  // LOAD_NAME g
            (131, 0),
            (1, 0),
            (89, 0),   // POP_EXCEPT
            (110, 2),  // JUMP_FORWARD -> 38
            (88, 0),   // END_FINALLY
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["f", "E", "g"],
    );
    assert_eq!(
        decompile(py38(), &main),
        "try:\n    f()\nexcept E:\n    g()\n"
    );
}

#[test]
fn test_chained_assignment() {
    // a = b = 1
    let main = module(
        wordcode(&[(100, 1), (4, 0), (90, 0), (90, 1), (100, 0), (83, 0)]),
        vec![Object::None, Object::Int(1)],
        &["a", "b"],
    );
    assert_eq!(decompile(py38(), &main), "a = b = 1\n");
}

#[test]
fn test_tuple_unpacking() {
    // a, b = t
    let main = module(
        wordcode(&[(101, 0), (92, 2), (90, 1), (90, 2), (100, 0), (83, 0)]),
        vec![Object::None],
        &["t", "a", "b"],
    );
    assert_eq!(decompile(py38(), &main), "a, b = t\n");
}

#[test]
fn test_augmented_assignment() {
    // x += 1
    let main = module(
        wordcode(&[(101, 0), (100, 1), (55, 0), (90, 0), (100, 0), (83, 0)]),
        vec![Object::None, Object::Int(1)],
        &["x"],
    );
    assert_eq!(decompile(py38(), &main), "x += 1\n");
}

#[test]
fn test_list_comprehension() {
    // r = [x for x in y]
    let mut comp = function(
        "<listcomp>",
        wordcode(&[
            (103, 0), // BUILD_LIST 0
            (124, 0), // LOAD_FAST .0
            (93, 8),  // FOR_ITER -> 14
            (125, 1), // STORE_FAST x
            (124, 1), // LOAD_FAST x
            (145, 2), // LIST_APPEND 2
            (113, 4), // JUMP_ABSOLUTE -> 4
            (83, 0),  // RETURN_VALUE
        ]),
        vec![Object::None],
        &[".0", "x"],
        1,
    );
    comp.stacksize = 4;
    let main = module(
        wordcode(&[
            (100, 1), // LOAD_CONST <code listcomp>
            (100, 2), // LOAD_CONST qualname
            (132, 0), // MAKE_FUNCTION
            (101, 0), // LOAD_NAME y
            (68, 0),  // GET_ITER
            (131, 1), // CALL_FUNCTION 1
            (90, 1),  // STORE_NAME r
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, Object::Code(Box::new(comp)), s("<listcomp>")],
        &["y", "r"],
    );
    assert_eq!(decompile(py38(), &main), "r = [x for x in y]\n");
}

#[test]
fn test_fstring() {
    // s = f'x={x!r}'
    let main = module(
        wordcode(&[
            (100, 1), // LOAD_CONST 'x='
            (101, 0), // LOAD_NAME x
            (155, 2), // FORMAT_VALUE !r
            (157, 2), // BUILD_STRING 2
            (90, 1),  // STORE_NAME s
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, s("x=")],
        &["x", "s"],
    );
    assert_eq!(decompile(py38(), &main), "s = f'x={x!r}'\n");
}

#[test]
fn test_import_plain() {
    // import os
    let main = module(
        legacy_code(&[
            (100, Some(0)), // LOAD_CONST -1
            (100, Some(1)), // LOAD_CONST None
            (108, Some(0)), // IMPORT_NAME os
            (90, Some(0)),  // STORE_NAME os
            (100, Some(1)),
            (83, None),
        ]),
        vec![Object::Int(-1), Object::None],
        &["os"],
    );
    assert_eq!(decompile(py27(), &main), "import os\n");
}

#[test]
fn test_import_from() {
    // from os.path import join
    let main = module(
        legacy_code(&[
            (100, Some(0)), // LOAD_CONST -1
            (100, Some(1)), // LOAD_CONST ('join',)
            (108, Some(0)), // IMPORT_NAME os.path
            (109, Some(1)), // IMPORT_FROM join
            (90, Some(1)),  // STORE_NAME join
            (1, None),      // POP_TOP
            (100, Some(2)),
            (83, None),
        ]),
        vec![Object::Int(-1), Object::Tuple(vec![s("join")]), Object::None],
        &["os.path", "join"],
    );
    assert_eq!(decompile(py27(), &main), "from os.path import join\n");
}

#[test]
fn test_py2_print_statement() {
    // print x
    let main = module(
        legacy_code(&[
            (101, Some(0)), // LOAD_NAME x
            (71, None),     // PRINT_ITEM
            (72, None),     // PRINT_NEWLINE
            (100, Some(0)), // LOAD_CONST None
            (83, None),
        ]),
        vec![Object::None],
        &["x"],
    );
    assert_eq!(decompile(py27(), &main), "print x\n");
}

#[test]
fn test_bool_chain_condition() {
    // if a and b: f()
    let main = module(
        wordcode(&[
            (101, 0),  // LOAD_NAME a
            (114, 14), // POP_JUMP_IF_FALSE -> 14
            (101, 1),  // LOAD_NAME b
            (114, 14), // POP_JUMP_IF_FALSE -> 14
            (101, 2),  // LOAD_NAME f
            (131, 0),
            (1, 0),
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None],
        &["a", "b", "f"],
    );
    assert_eq!(decompile(py38(), &main), "if a and b:\n    f()\n");
}

#[test]
fn test_lambda_default() {
    // g = lambda x: x + 1
    let lam = function(
        "<lambda>",
        wordcode(&[(124, 0), (100, 1), (23, 0), (83, 0)]),
        vec![Object::None, Object::Int(1)],
        &["x"],
        1,
    );
    let main = module(
        wordcode(&[
            (100, 1), // LOAD_CONST <code lambda>
            (100, 2), // LOAD_CONST qualname
            (132, 0), // MAKE_FUNCTION
            (90, 0),  // STORE_NAME g
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, Object::Code(Box::new(lam)), s("<lambda>")],
        &["g"],
    );
    assert_eq!(decompile(py38(), &main), "g = lambda x: x + 1\n");
}

#[test]
fn test_function_docstring_and_defaults() {
    // def f(a, b=2):
    //     'doc'
    //     return a
    let f = function(
        "f",
        wordcode(&[(124, 0), (83, 0)]),
        vec![s("doc")],
        &["a", "b"],
        2,
    );
    let main = module(
        wordcode(&[
            (100, 1), // LOAD_CONST (2,) defaults tuple
            (100, 2), // LOAD_CONST <code f>
            (100, 3), // LOAD_CONST qualname
            (132, 1), // MAKE_FUNCTION defaults
            (90, 0),  // STORE_NAME f
            (100, 0),
            (83, 0),
        ]),
        vec![
            Object::None,
            Object::Tuple(vec![Object::Int(2)]),
            Object::Code(Box::new(f)),
            s("f"),
        ],
        &["f"],
    );
    assert_eq!(
        decompile(py38(), &main),
        "def f(a, b=2):\n    'doc'\n    return a\n"
    );
}

#[test]
fn test_determinism() {
    let main = module(
        wordcode(&[
            (101, 0),
            (114, 10),
            (100, 1),
            (90, 1),
            (110, 4),
            (100, 2),
            (90, 1),
            (100, 0),
            (83, 0),
        ]),
        vec![Object::None, Object::Int(1), Object::Int(2)],
        &["a", "b"],
    );
    let first = decompile(py38(), &main);
    let second = decompile(py38(), &main);
    assert_eq!(first, second);
}

#[test]
fn test_delete_statement() {
    let main = module(
        wordcode(&[(91, 0), (100, 0), (83, 0)]),
        vec![Object::None],
        &["x"],
    );
    assert_eq!(decompile(py38(), &main), "del x\n");
}

#[test]
fn test_unknown_opcode_is_fatal() {
    let main = module(wordcode(&[(200, 0)]), vec![Object::None], &[]);
    let mut decompiler = Decompiler::new(py38());
    assert!(decompiler.decompile_module(&main).is_err());
}

#[test]
fn test_dirty_build_is_flagged() {
    // BINARY_ADD on an empty stack is a soft error: output still comes
    // back, but the build is no longer clean.
    let main = module(
        wordcode(&[(23, 0), (1, 0), (100, 0), (83, 0)]),
        vec![Object::None],
        &[],
    );
    let mut decompiler = Decompiler::new(py38());
    let root = decompiler.decompile_module(&main).expect("soft errors keep going");
    assert!(!decompiler.clean_build);
    let text = print_source(&root, py38(), decompiler.clean_build);
    assert!(text.starts_with("# WARNING"));
}
