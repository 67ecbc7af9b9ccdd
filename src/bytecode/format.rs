//! The binary `.umka` program format (little-endian).
//!
//! Layout: header (version, const/function/vtable counts, code size in
//! bytes), constant pool, function table, vmethod and vfield triples, then
//! the code section as `{opcode: u8, operand: i64}` pairs where the operand
//! is present iff the opcode is operand-bearing. Function code offsets are
//! instruction indices into the decoded stream, not byte offsets.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::{ErrorKind, UmkaError, UmkaResult};

use super::instruction::Instruction;
use super::opcode::Opcode;
use super::program::{ConstPool, Constant, FunctionInfo, Program};

pub const VERSION: u8 = 1;

const TAG_INT: u8 = 0x01;
const TAG_DOUBLE: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_UNIT: u8 = 0x04;

pub fn write_program<W: Write>(program: &Program, mut writer: W) -> UmkaResult<()> {
    let constants = program.pool.snapshot();
    let code_bytes = encode_code(&program.code);

    writer.write_all(&[VERSION])?;
    writer.write_all(&count_u16(constants.len(), "constant pool")?.to_le_bytes())?;
    writer.write_all(&count_u16(program.functions.len(), "function table")?.to_le_bytes())?;
    let code_size = u32::try_from(code_bytes.len())
        .map_err(|_| UmkaError::new(ErrorKind::Parse, "code section exceeds u32"))?;
    writer.write_all(&code_size.to_le_bytes())?;
    writer.write_all(&count_u16(program.vmethod_table.len(), "vmethod table")?.to_le_bytes())?;
    writer.write_all(&count_u16(program.vfield_table.len(), "vfield table")?.to_le_bytes())?;

    for constant in &constants {
        match constant {
            Constant::Int(v) => {
                writer.write_all(&[TAG_INT])?;
                writer.write_all(&v.to_le_bytes())?;
            }
            Constant::Double(v) => {
                writer.write_all(&[TAG_DOUBLE])?;
                writer.write_all(&v.to_le_bytes())?;
            }
            Constant::Str(v) => {
                writer.write_all(&[TAG_STRING])?;
                writer.write_all(&(v.len() as i64).to_le_bytes())?;
                writer.write_all(v.as_bytes())?;
            }
            Constant::Unit => writer.write_all(&[TAG_UNIT])?,
        }
    }

    for info in program.functions.values() {
        writer.write_all(&(info.code_begin as i64).to_le_bytes())?;
        writer.write_all(&(info.code_end as i64).to_le_bytes())?;
        writer.write_all(&(info.arg_count as i64).to_le_bytes())?;
        writer.write_all(&(info.local_count as i64).to_le_bytes())?;
    }

    for &(class_id, method_id, function_id) in program.vmethod_table.iter() {
        writer.write_all(&class_id.to_le_bytes())?;
        writer.write_all(&method_id.to_le_bytes())?;
        writer.write_all(&function_id.to_le_bytes())?;
    }
    for &(class_id, field_id, field_index) in program.vfield_table.iter() {
        writer.write_all(&class_id.to_le_bytes())?;
        writer.write_all(&field_id.to_le_bytes())?;
        writer.write_all(&field_index.to_le_bytes())?;
    }

    writer.write_all(&code_bytes)?;
    Ok(())
}

pub fn encode_program(program: &Program) -> UmkaResult<Vec<u8>> {
    let mut buffer = Vec::new();
    write_program(program, &mut buffer)?;
    Ok(buffer)
}

pub fn read_program<R: Read>(mut reader: R) -> UmkaResult<Program> {
    let version = read_u8(&mut reader)?;
    if version != VERSION {
        return Err(UmkaError::new(
            ErrorKind::Parse,
            format!("unsupported bytecode version {version}"),
        ));
    }
    let const_count = read_u16(&mut reader)?;
    let func_count = read_u16(&mut reader)?;
    let code_size = read_u32(&mut reader)? as usize;
    let vmethod_count = read_u16(&mut reader)?;
    let vfield_count = read_u16(&mut reader)?;

    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        constants.push(read_constant(&mut reader)?);
    }

    let mut functions = BTreeMap::new();
    for id in 0..func_count as u64 {
        let code_begin = read_i64(&mut reader)?;
        let code_end = read_i64(&mut reader)?;
        let arg_count = read_i64(&mut reader)?;
        let local_count = read_i64(&mut reader)?;
        if code_begin < 0 || code_end < code_begin || arg_count < 0 || local_count < 0 {
            return Err(UmkaError::new(
                ErrorKind::Parse,
                format!("invalid function table entry for id {id}"),
            ));
        }
        functions.insert(
            id,
            FunctionInfo {
                id,
                code_begin: code_begin as usize,
                code_end: code_end as usize,
                arg_count: arg_count as usize,
                local_count: local_count as usize,
            },
        );
    }

    let mut vmethod_table = Vec::with_capacity(vmethod_count as usize);
    for _ in 0..vmethod_count {
        vmethod_table.push((read_i64(&mut reader)?, read_i64(&mut reader)?, read_i64(&mut reader)?));
    }
    let mut vfield_table = Vec::with_capacity(vfield_count as usize);
    for _ in 0..vfield_count {
        vfield_table.push((read_i64(&mut reader)?, read_i64(&mut reader)?, read_i64(&mut reader)?));
    }

    let mut code_bytes = vec![0u8; code_size];
    reader
        .read_exact(&mut code_bytes)
        .map_err(|_| UmkaError::new(ErrorKind::Parse, "unexpected end of code section"))?;
    let code = decode_code(&code_bytes)?;

    for info in functions.values() {
        if info.code_end > code.len() {
            return Err(UmkaError::new(
                ErrorKind::Parse,
                format!("function {} code range exceeds stream", info.id),
            ));
        }
    }

    Ok(Program::new(
        code,
        ConstPool::from_vec(constants),
        functions,
        vmethod_table,
        vfield_table,
    ))
}

pub fn encode_code(code: &[Instruction]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(code.len() * 9);
    for instruction in code {
        bytes.push(instruction.opcode as u8);
        if instruction.opcode.has_operand() {
            bytes.extend_from_slice(&instruction.operand.to_le_bytes());
        }
    }
    bytes
}

pub fn decode_code(bytes: &[u8]) -> UmkaResult<Vec<Instruction>> {
    let mut code = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        let opcode = Opcode::try_from(bytes[index])?;
        index += 1;
        let operand = if opcode.has_operand() {
            let end = index + 8;
            if end > bytes.len() {
                return Err(UmkaError::new(
                    ErrorKind::Parse,
                    format!("missing operand for {}", opcode.name()),
                ));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[index..end]);
            index = end;
            i64::from_le_bytes(buf)
        } else {
            0
        };
        code.push(Instruction::new(opcode, operand));
    }
    Ok(code)
}

fn read_constant<R: Read>(reader: &mut R) -> UmkaResult<Constant> {
    let tag = read_u8(reader)?;
    match tag {
        TAG_INT => Ok(Constant::Int(read_i64(reader)?)),
        TAG_DOUBLE => {
            let mut buf = [0u8; 8];
            read_exact(reader, &mut buf)?;
            Ok(Constant::Double(f64::from_le_bytes(buf)))
        }
        TAG_STRING => {
            let len = read_i64(reader)?;
            if len < 0 {
                return Err(UmkaError::new(ErrorKind::Parse, "negative string length"));
            }
            let mut data = vec![0u8; len as usize];
            read_exact(reader, &mut data)?;
            let text = String::from_utf8(data)
                .map_err(|_| UmkaError::new(ErrorKind::Parse, "invalid utf-8 in string constant"))?;
            Ok(Constant::Str(text))
        }
        TAG_UNIT => Ok(Constant::Unit),
        other => Err(UmkaError::new(
            ErrorKind::Parse,
            format!("unknown constant tag 0x{other:02X}"),
        )),
    }
}

fn count_u16(len: usize, what: &str) -> UmkaResult<u16> {
    u16::try_from(len)
        .map_err(|_| UmkaError::new(ErrorKind::Parse, format!("{what} exceeds u16 entries")))
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> UmkaResult<()> {
    reader
        .read_exact(buf)
        .map_err(|_| UmkaError::new(ErrorKind::Parse, "unexpected end of bytecode"))
}

fn read_u8<R: Read>(reader: &mut R) -> UmkaResult<u8> {
    let mut buf = [0u8; 1];
    read_exact(reader, &mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> UmkaResult<u16> {
    let mut buf = [0u8; 2];
    read_exact(reader, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> UmkaResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(reader, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> UmkaResult<i64> {
    let mut buf = [0u8; 8];
    read_exact(reader, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}
