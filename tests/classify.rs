use anyhow::Result;
use jumptrace::{BreakpointManager, Command, Error, InstructionClassifier, Jump, JumpTable, ProcessControl};
use pretty_assertions::assert_eq;

mod support;
use support::*;

const CODE: u64 = 0x4000;

// A short jump, an extended jump, and a non-jump, back to back.
fn synthetic() -> FakeTracee {
    let code = [
        0x74, 0x05, // je +5
        0x0f, 0x85, 0x10, 0x00, 0x00, 0x00, // jne +0x10
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, // padding
    ];

    FakeTracee::new().with_code(CODE, &code)
}

#[test]
fn test_classify_at() -> Result<()> {
    let mut tracee = synthetic();
    let handle = tracee.launch(Command::new("fake"))?;
    let classifier = InstructionClassifier::default();

    assert_eq!(classifier.classify_at(&tracee, handle, CODE)?, Jump::ShortJump);
    assert_eq!(classifier.classify_at(&tracee, handle, CODE + 2)?, Jump::ExtendedJump);
    assert_eq!(classifier.classify_at(&tracee, handle, CODE + 8)?, Jump::NotAJump);

    Ok(())
}

#[test]
fn test_classify_at_legacy() -> Result<()> {
    let mut tracee = synthetic();
    let handle = tracee.launch(Command::new("fake"))?;
    let classifier = InstructionClassifier::new(JumpTable::LEGACY);

    assert_eq!(classifier.classify_at(&tracee, handle, CODE)?, Jump::ShortJump);
    assert_eq!(classifier.classify_at(&tracee, handle, CODE + 2)?, Jump::ExtendedJump);

    Ok(())
}

#[test]
fn test_classify_through_breakpoint() -> Result<()> {
    let mut tracee = synthetic();
    let handle = tracee.launch(Command::new("fake"))?;
    let classifier = InstructionClassifier::default();

    let mut bps = BreakpointManager::new();
    bps.set_breakpoint(&mut tracee, handle, CODE)?;
    bps.set_breakpoint(&mut tracee, handle, CODE + 3)?;

    // The raw bytes show the traps.
    assert_eq!(classifier.classify_at(&tracee, handle, CODE)?, Jump::NotAJump);
    assert_eq!(classifier.classify_at(&tracee, handle, CODE + 2)?, Jump::NotAJump);

    assert_eq!(classifier.classify_shadowed(&tracee, handle, CODE, &bps)?, Jump::ShortJump);
    assert_eq!(classifier.classify_shadowed(&tracee, handle, CODE + 2, &bps)?, Jump::ExtendedJump);

    Ok(())
}

#[test]
fn test_classify_unmapped() -> Result<()> {
    let mut tracee = synthetic();
    let handle = tracee.launch(Command::new("fake"))?;
    let classifier = InstructionClassifier::default();

    let err = classifier.classify_at(&tracee, handle, 0x10).unwrap_err();
    assert!(matches!(err, Error::MemoryAccess { addr: 0x10, .. }));

    Ok(())
}

#[test]
fn test_classify_at_end_of_mapping() -> Result<()> {
    // One word of code, with nothing mapped after it.
    let code = [
        0x90, 0x90, // nop; nop
        0x74, 0x05, // je +5
        0x0f, 0x84, 0x00, // truncated jne, only the opcode matters
        0xc3, // ret
    ];
    let mut tracee = FakeTracee::new().with_code(0x5000, &code);
    let handle = tracee.launch(Command::new("fake"))?;
    let classifier = InstructionClassifier::default();

    assert_eq!(classifier.classify_at(&tracee, handle, 0x5002)?, Jump::ShortJump);
    assert_eq!(classifier.classify_at(&tracee, handle, 0x5004)?, Jump::ExtendedJump);
    assert_eq!(classifier.classify_at(&tracee, handle, 0x5007)?, Jump::NotAJump);

    let mut bps = BreakpointManager::new();
    bps.set_breakpoint(&mut tracee, handle, 0x5003)?;
    bps.set_breakpoint(&mut tracee, handle, 0x5007)?;

    assert_eq!(tracee.byte(0x5007), 0xcc);
    assert_eq!(classifier.classify_shadowed(&tracee, handle, 0x5002, &bps)?, Jump::ShortJump);
    assert_eq!(classifier.classify_shadowed(&tracee, handle, 0x5007, &bps)?, Jump::NotAJump);

    bps.restore_all(&mut tracee, handle)?;
    assert_eq!(tracee.byte(0x5003), 0x05);
    assert_eq!(tracee.byte(0x5007), 0xc3);

    Ok(())
}
