//! Integration tests for fcasm.
//!
//! These exercise the public API end-to-end: source text in, object file
//! out, and back through the disassembler.

use fcasm::{
    assemble, disassemble, AsmError, Assembler, ObjectFile, RelocKind,
};

fn strip_comments(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        let code = line.split("//").next().unwrap_or("");
        if !code.trim().is_empty() {
            out.push_str(code.trim_end());
            out.push('\n');
        }
    }
    out
}

fn words(obj: &ObjectFile, section: usize) -> Vec<u32> {
    obj.sections[section]
        .data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============================================================================
// One-shot API
// ============================================================================

#[test]
fn minimal_program_assembles() {
    let obj = assemble(
        "section code execute\nfunction f: public f\nint32 r1 = r2 + 1\nreturn\nend\n",
    )
    .unwrap();
    assert_eq!(obj.sections.len(), 1);
    assert_eq!(obj.sections[0].data.len(), 8);
    let f = obj.find_symbol("f").expect("public symbol f");
    assert_eq!(f.section, 1);
    assert_eq!(f.value, 0);
}

#[test]
fn semicolon_separated_program() {
    let obj = assemble(
        "section code execute; function f: public f; int32 r1 = r2 + 1; return; end",
    )
    .unwrap();
    assert_eq!(obj.sections[0].data.len(), 8);
}

#[test]
fn empty_input_is_an_empty_object() {
    let obj = assemble("").unwrap();
    assert!(obj.sections.is_empty());
    assert!(obj.symbols.is_empty());
}

// ============================================================================
// Scenario: assemble, disassemble, re-assemble
// ============================================================================

#[test]
fn roundtrip_regenerates_equivalent_source() {
    let src = "section code execute\nfunction f: public f\nint32 r1 = r2 + 1\nreturn\nend\n";
    let obj1 = assemble(src).unwrap();
    let listing = disassemble(&obj1).unwrap();
    assert!(listing.contains("function f:"), "{}", listing);
    assert!(listing.contains("int32 r1 = add(r2, 1)"), "{}", listing);
    let obj2 = assemble(&strip_comments(&listing)).unwrap();
    assert_eq!(obj1.sections[0].data, obj2.sections[0].data);
}

#[test]
fn roundtrip_larger_program() {
    let src = "\
section code execute
extern helper:
function outer: public outer
push r1
push r2
int32 r3 = [r1 + 8]
int64 r4 = min(r3, r2)
if (r4 > 0) {
int32 r5 = r5 + 1
} else {
int32 r5 = r5 - 1
}
call helper
pop r2
pop r1
return
end
";
    let obj1 = assemble(src).unwrap();
    let listing = disassemble(&obj1).unwrap();
    let obj2 = assemble(&strip_comments(&listing)).unwrap();
    assert_eq!(
        obj1.sections[0].data, obj2.sections[0].data,
        "listing was:\n{}",
        listing
    );
    let relocs1: Vec<_> = obj1
        .relocations
        .iter()
        .map(|r| (r.offset, r.symbol.clone(), r.kind))
        .collect();
    let relocs2: Vec<_> = obj2
        .relocations
        .iter()
        .map(|r| (r.offset, r.symbol.clone(), r.kind))
        .collect();
    assert_eq!(relocs1, relocs2);
}

// ============================================================================
// Scenario: forward branch growth across pass-4 iterations
// ============================================================================

#[test]
fn forward_branch_selects_wider_displacement_on_growth() {
    let mut src = String::from("section code execute\nfunction f: public f\nif (r1 > 0) {\n");
    for _ in 0..200 {
        src.push_str("int32 r2 = r2 + 1\n");
    }
    src.push_str("}\nreturn\nend\n");
    let obj = assemble(&src).unwrap();
    let w = words(&obj, 0);
    // The inverted conditional jump grew to the two-word, 16-bit
    // displacement format: il = 2.
    assert_eq!(w[0] >> 30, 2, "word 0 = {:08X}", w[0]);
    // A short body stays in the one-word form.
    let short = assemble(
        "section code execute\nfunction f: public f\nif (r1 > 0) {\nint32 r2 = r2 + 1\n}\nreturn\nend\n",
    )
    .unwrap();
    let ws = words(&short, 0);
    assert_eq!(ws[0] >> 30, 1, "word 0 = {:08X}", ws[0]);
}

// ============================================================================
// Scenario: cross-section symbol difference
// ============================================================================

#[test]
fn symbol_difference_emits_diff_relocation() {
    let obj = assemble(
        "\
section data read write
label_a:
int32 a = 1
label_b:
int32 b = 2
int32 diff = label_b - label_a
end
",
    )
    .unwrap();
    let r = obj
        .relocations
        .iter()
        .find(|r| matches!(r.kind, RelocKind::Diff { .. }))
        .expect("difference relocation");
    assert_eq!(r.symbol, "label_b");
    assert_eq!(r.ref_sym.as_deref(), Some("label_a"));
    assert!(matches!(r.kind, RelocKind::Diff { size: 4, scale: 1 }));
    assert_eq!(r.offset, 8);
}

// ============================================================================
// Scenario: switch dispatch selection by case density
// ============================================================================

#[test]
fn dense_switch_emits_jump_table() {
    let mut src = String::from(
        "section code execute\nfunction f: public f\nswitch (int32 r1) {\n",
    );
    for k in 0..8 {
        src.push_str(&format!("case {}:\nint32 r2 = r2 + {}\n", k, k + 1));
    }
    src.push_str("}\nreturn\nend\n");
    let obj = assemble(&src).unwrap();
    let table_relocs: Vec<_> = obj
        .relocations
        .iter()
        .filter(|r| matches!(r.kind, RelocKind::Diff { size: 4, scale: 4 }))
        .collect();
    assert_eq!(table_relocs.len(), 8, "one table entry per case");
    // Entries are consecutive words.
    let base = table_relocs[0].offset;
    for (n, r) in table_relocs.iter().enumerate() {
        assert_eq!(r.offset, base + n as u32 * 4);
    }
}

#[test]
fn sparse_switch_emits_compare_chain() {
    let mut src = String::from(
        "section code execute\nfunction f: public f\nswitch (int32 r1) {\n",
    );
    for k in [1, 100, 1000] {
        src.push_str(&format!("case {}:\nint32 r2 = r2 + 1\n", k));
    }
    src.push_str("}\nreturn\nend\n");
    let obj = assemble(&src).unwrap();
    assert!(
        obj.relocations
            .iter()
            .all(|r| !matches!(r.kind, RelocKind::Diff { .. })),
        "a compare chain needs no jump table"
    );
}

#[test]
fn dense_switch_roundtrips_through_disassembly() {
    let mut src = String::from(
        "section code execute\nfunction f: public f\nswitch (int32 r1) {\n",
    );
    for k in 0..4 {
        src.push_str(&format!("case {}:\nint32 r2 = r2 + {}\n", k, k + 1));
    }
    src.push_str("}\nreturn\nend\n");
    let obj1 = assemble(&src).unwrap();
    let listing = disassemble(&obj1).unwrap();
    let obj2 = assemble(&strip_comments(&listing)).unwrap();
    assert_eq!(
        obj1.sections[0].data, obj2.sections[0].data,
        "listing was:\n{}",
        listing
    );
}

// ============================================================================
// Scenario: vector loop
// ============================================================================

#[test]
fn vector_loop_lowers_to_sub_maxlen_jump_positive() {
    let obj = assemble(
        "\
section code execute
function f: public f
for (float32 v1 in [r1 - r2]) {
v2 += v1
}
return
end
",
    )
    .unwrap();
    let w = words(&obj, 0);
    // Somewhere in the body sits the combined subtract-max-length /
    // jump-positive instruction (jump category, op1 = 40, one word).
    let found = w.iter().any(|&word| {
        word >> 30 == 1 && (word >> 27) & 7 == 4 && (word >> 21) & 63 == 40
    });
    assert!(found, "words: {:08X?}", w);
}

// ============================================================================
// Scenario: error reporting continues assembly
// ============================================================================

#[test]
fn out_of_range_data_reports_and_continues() {
    let err = assemble(
        "\
section data read write
int8 x = 1000
int8 y = 2
end
",
    )
    .unwrap_err();
    let AsmError::Multiple { errors } = err else {
        panic!("expected collected errors");
    };
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        AsmError::ImmediateOverflow {
            value: 1000,
            dtype: "int8",
            ..
        }
    ));
}

#[test]
fn multiple_errors_collected_in_source_order() {
    let err = assemble(
        "\
section code execute
function f:
jump missing_one
int32 r1 = r2 + r3 + r4
jump missing_two
return
end
",
    )
    .unwrap_err();
    let AsmError::Multiple { errors } = err else {
        panic!("expected collected errors");
    };
    assert!(errors.len() >= 3, "{:?}", errors);
    let offsets: Vec<usize> = errors.iter().filter_map(|e| e.span()).map(|s| s.offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted, "errors come in source order");
}

// ============================================================================
// Object container
// ============================================================================

#[test]
fn container_bytes_roundtrip() {
    let obj = assemble(
        "\
section code execute
extern callee:
function f: public f
call callee
return
end
section data read write
int32 tab = 1, 2, 3
end
",
    )
    .unwrap();
    let bytes = obj.to_bytes();
    let back = ObjectFile::from_bytes(&bytes).unwrap();
    assert_eq!(obj, back);
}

// ============================================================================
// Builder API
// ============================================================================

#[test]
fn builder_emits_incrementally() {
    let mut asm = Assembler::new();
    asm.emit("section code execute");
    asm.emit("function f: public f");
    asm.emit("return");
    asm.emit("end");
    let obj = asm.finish().unwrap().into_object();
    assert_eq!(obj.sections[0].data.len(), 4);
}

#[test]
fn while_loop_assembles_and_roundtrips() {
    let src = "\
section code execute
function f: public f
while (int32 r1 > 0) {
int32 r1 = r1 - 1
}
return
end
";
    let obj1 = assemble(src).unwrap();
    let listing = disassemble(&obj1).unwrap();
    let obj2 = assemble(&strip_comments(&listing)).unwrap();
    assert_eq!(
        obj1.sections[0].data, obj2.sections[0].data,
        "listing was:\n{}",
        listing
    );
}

#[test]
fn do_while_loop_branches_backward() {
    let obj = assemble(
        "\
section code execute
function f: public f
do {
int32 r1 = r1 - 1
} while (r1 != 0)
return
end
",
    )
    .unwrap();
    // The merged or plain backward conditional jump sits after the body
    // and points backward; total stays compact.
    assert!(obj.sections[0].data.len() <= 16);
}

#[test]
fn masked_vector_add_roundtrips() {
    let src = "\
section code execute
function f: public f
int32 v1 = v2 + v3, mask = r4
return
end
";
    let obj1 = assemble(src).unwrap();
    let listing = disassemble(&obj1).unwrap();
    assert!(listing.contains("mask = r4"), "{}", listing);
    let obj2 = assemble(&strip_comments(&listing)).unwrap();
    assert_eq!(obj1.sections[0].data, obj2.sections[0].data);
}

#[test]
fn meta_variables_parameterize_code() {
    let obj = assemble(
        "\
%offset = 24
section code execute
function f: public f
int32 r1 = [r2 + offset]
return
end
",
    )
    .unwrap();
    let w = words(&obj, 0);
    // Scaled 8-bit offset form: 24 / 4 = 6 in the low byte.
    assert_eq!(w[0] & 0xFF, 6, "{:08X}", w[0]);
}
