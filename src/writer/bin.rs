//! Writes a compiled unit in the binary bytecode format.

use std::fs;
use std::io;
use std::path::Path;

use log::info;

use crate::processor::blob;
use crate::processor::bytecode::Bytecode;

pub fn emit(code: &Bytecode, path: &Path) -> io::Result<()> {
    let data = blob::encode(code).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, &data)?;
    info!("wrote {} bytes of bytecode to {}", data.len(), path.display());
    Ok(())
}

/// Reads back a file written by [`emit`].
pub fn load(path: &Path) -> io::Result<Bytecode> {
    let data = fs::read(path)?;
    blob::decode(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::bytecode::{Instruction, JumpTarget};
    use crate::processor::decimal::Decimal;

    #[test]
    fn test_emit_then_load() {
        let code: Bytecode = vec![
            Instruction::AddLayout("a.bls".into()),
            Instruction::PushNum(Decimal::from(3)),
            Instruction::Jz(JumpTarget::Offset(2)),
            Instruction::PushStr("x".into()),
            Instruction::Ret,
        ]
        .into_iter()
        .collect();
        let path = std::env::temp_dir().join(format!("layoutvm-bin-{}", std::process::id())).join("a.blc");
        emit(&code, &path).unwrap();
        assert_eq!(load(&path).unwrap(), code);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_unresolved_label_is_rejected() {
        let code: Bytecode = vec![Instruction::Jmp(JumpTarget::label("nowhere"))].into_iter().collect();
        let path = std::env::temp_dir().join("layoutvm-unresolved.blc");
        let err = emit(&code, &path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!path.exists());
    }
}
