//! Built-in functions, dispatched out-of-band by `CALL` via ids reserved at
//! the top of the signed 64-bit range. They never appear in the function
//! table; user function ids start at 0 and grow modestly, so the gap cannot
//! collide for any reasonable program.

use std::fs;
use std::io::BufRead;

use rand::Rng;

use crate::memory::Entity;
use crate::vm::machine::Machine;
use crate::vm::ops;
use crate::{ErrorKind, UmkaError, UmkaResult};

pub const PRINT: i64 = i64::MAX;
pub const LEN: i64 = i64::MAX - 1;
pub const GET: i64 = i64::MAX - 2;
pub const SET: i64 = i64::MAX - 3;
pub const ADD_ELEM: i64 = i64::MAX - 4;
pub const REMOVE: i64 = i64::MAX - 5;
// i64::MAX - 6 is unassigned; the gap is inherited from the original table.
pub const WRITE: i64 = i64::MAX - 7;
pub const READ: i64 = i64::MAX - 8;
pub const ASSERT: i64 = i64::MAX - 9;
pub const INPUT: i64 = i64::MAX - 10;
pub const RANDOM: i64 = i64::MAX - 11;

pub fn is_builtin(id: i64) -> bool {
    name(id).is_some()
}

pub fn name(id: i64) -> Option<&'static str> {
    Some(match id {
        PRINT => "print",
        LEN => "len",
        GET => "get",
        SET => "set",
        ADD_ELEM => "add_elem",
        REMOVE => "remove",
        WRITE => "write",
        READ => "read",
        ASSERT => "assert",
        INPUT => "input",
        RANDOM => "random",
        _ => return None,
    })
}

pub fn id_for_name(name: &str) -> Option<i64> {
    Some(match name {
        "print" => PRINT,
        "len" => LEN,
        "get" => GET,
        "set" => SET,
        "add_elem" => ADD_ELEM,
        "remove" => REMOVE,
        "write" => WRITE,
        "read" => READ,
        "assert" => ASSERT,
        "input" => INPUT,
        "random" => RANDOM,
        _ => return None,
    })
}

pub fn arity(id: i64) -> Option<usize> {
    Some(match id {
        PRINT | LEN | READ | ASSERT => 1,
        GET | ADD_ELEM | REMOVE | WRITE => 2,
        SET => 3,
        INPUT | RANDOM => 0,
        _ => return None,
    })
}

/// Executes one built-in call. Arguments were pushed in reverse source
/// order, so pops yield them in source order. Every built-in leaves exactly
/// one value on the stack.
pub(crate) fn invoke(machine: &mut Machine, id: i64) -> UmkaResult<()> {
    match id {
        PRINT => {
            let value = machine.pop_ref()?;
            let text = machine.render_ref(value)?;
            machine.write_output_line(&text)?;
            machine.push_new(Entity::Unit)
        }
        LEN => {
            let value = machine.pop_ref()?;
            let length = match machine.entity(value)? {
                Entity::Str(text) => text.len() as i64,
                Entity::Array(items) => items.len() as i64,
                other => {
                    return Err(UmkaError::new(
                        ErrorKind::Type,
                        format!("len() expects a string or array, got {}", other.type_name()),
                    ))
                }
            };
            machine.push_new(Entity::Int(length))
        }
        GET => {
            let array = machine.pop_ref()?;
            let index = machine.pop_index()?;
            let items = machine.array_items(array)?;
            let element = *items.get(check_bounds(index, items.len())?).expect("checked");
            machine.push(element);
            Ok(())
        }
        SET => {
            let array = machine.pop_ref()?;
            let index = machine.pop_index()?;
            let value = machine.pop_ref()?;
            let items = machine.array_items_mut(array)?;
            let slot = check_bounds(index, items.len())?;
            items[slot] = value;
            machine.push_new(Entity::Unit)
        }
        ADD_ELEM => {
            let array = machine.pop_ref()?;
            let value = machine.pop_ref()?;
            machine.array_items_mut(array)?.push(value);
            machine.push_new(Entity::Unit)
        }
        REMOVE => {
            let array = machine.pop_ref()?;
            let index = machine.pop_index()?;
            let items = machine.array_items_mut(array)?;
            let slot = check_bounds(index, items.len())?;
            items.remove(slot);
            machine.push_new(Entity::Unit)
        }
        WRITE => {
            let path = machine.pop_string()?;
            let value = machine.pop_ref()?;
            let text = machine.render_ref(value)?;
            fs::write(&path, format!("{text}\n"))
                .map_err(|err| UmkaError::new(ErrorKind::Io, err.to_string()))?;
            machine.push_new(Entity::Unit)
        }
        READ => {
            let path = machine.pop_string()?;
            let text = fs::read_to_string(&path)
                .map_err(|err| UmkaError::new(ErrorKind::Io, err.to_string()))?;
            // Line entities are parked on the operand stack while the array
            // is assembled, keeping them rooted across collections.
            let mut count = 0usize;
            for line in text.lines() {
                machine.push_new(Entity::Str(line.to_string()))?;
                count += 1;
            }
            machine.build_array(count)
        }
        ASSERT => {
            let value = machine.pop_ref()?;
            if !ops::truthy(machine.entity(value)?) {
                return Err(UmkaError::new(ErrorKind::Assertion, "assertion failed"));
            }
            machine.push_new(Entity::Unit)
        }
        INPUT => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|err| UmkaError::new(ErrorKind::Io, err.to_string()))?;
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            machine.push_new(Entity::Str(line))
        }
        RANDOM => {
            let value = rand::thread_rng().gen::<f64>();
            machine.push_new(Entity::Double(value))
        }
        other => Err(UmkaError::new(
            ErrorKind::Resolution,
            format!("call to unknown function id {other}"),
        )),
    }
}

fn check_bounds(index: i64, len: usize) -> UmkaResult<usize> {
    if index < 0 || index as usize >= len {
        return Err(UmkaError::new(
            ErrorKind::Bounds,
            format!("array index {index} out of bounds for length {len}"),
        ));
    }
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_fill_the_top_of_the_i64_range() {
        assert_eq!(PRINT, i64::MAX);
        assert_eq!(REMOVE, i64::MAX - 5);
        assert_eq!(WRITE, i64::MAX - 7);
        assert_eq!(RANDOM, i64::MAX - 11);
        assert!(!is_builtin(i64::MAX - 6));
        assert!(!is_builtin(0));
    }

    #[test]
    fn names_and_ids_round_trip() {
        for id in [
            PRINT, LEN, GET, SET, ADD_ELEM, REMOVE, WRITE, READ, ASSERT, INPUT, RANDOM,
        ] {
            let name = name(id).expect("named");
            assert_eq!(id_for_name(name), Some(id));
            assert!(arity(id).is_some());
        }
    }
}
