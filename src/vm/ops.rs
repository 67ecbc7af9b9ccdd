//! Value-level operations: the unified numeric tower, comparisons, logic,
//! casts and canonical rendering.

use std::collections::HashSet;

use crate::bytecode::Opcode;
use crate::memory::{Entity, Heap};
use crate::{ErrorKind, UmkaError, UmkaResult};

/// A numeric viewed through the tower: bool widens to int widens to double.
enum Num {
    Int(i64),
    Double(f64),
}

fn as_num(entity: &Entity) -> Option<Num> {
    match entity {
        Entity::Int(v) => Some(Num::Int(*v)),
        Entity::Double(v) => Some(Num::Double(*v)),
        Entity::Bool(v) => Some(Num::Int(i64::from(*v))),
        _ => None,
    }
}

fn type_error(op: Opcode, a: &Entity, b: &Entity) -> UmkaError {
    UmkaError::new(
        ErrorKind::Type,
        format!(
            "unsupported operands for {}: {} and {}",
            op.name(),
            a.type_name(),
            b.type_name()
        ),
    )
}

/// Binary `+ - * /` over all numeric pairs; the result promotes toward the
/// more general operand type. `a` is the left operand.
pub fn arithmetic(op: Opcode, a: &Entity, b: &Entity) -> UmkaResult<Entity> {
    let (Some(left), Some(right)) = (as_num(a), as_num(b)) else {
        return Err(type_error(op, a, b));
    };
    match (left, right) {
        (Num::Int(left), Num::Int(right)) => int_arithmetic(op, left, right),
        (left, right) => {
            let left = widen(left);
            let right = widen(right);
            // IEEE-754 semantics; double division by zero is not an error.
            let value = match op {
                Opcode::Add => left + right,
                Opcode::Sub => left - right,
                Opcode::Mul => left * right,
                Opcode::Div => left / right,
                _ => unreachable!("non-arithmetic opcode {}", op.name()),
            };
            Ok(Entity::Double(value))
        }
    }
}

fn widen(num: Num) -> f64 {
    match num {
        Num::Int(v) => v as f64,
        Num::Double(v) => v,
    }
}

fn int_arithmetic(op: Opcode, left: i64, right: i64) -> UmkaResult<Entity> {
    let value = match op {
        Opcode::Add => left.wrapping_add(right),
        Opcode::Sub => left.wrapping_sub(right),
        Opcode::Mul => left.wrapping_mul(right),
        Opcode::Div => {
            if right == 0 {
                return Err(UmkaError::new(
                    ErrorKind::Arithmetic,
                    "integer division by zero",
                ));
            }
            left.wrapping_div(right)
        }
        _ => unreachable!("non-arithmetic opcode {}", op.name()),
    };
    Ok(Entity::Int(value))
}

/// `%` is defined only on integral operands (bool/int).
pub fn remainder(a: &Entity, b: &Entity) -> UmkaResult<Entity> {
    let integral = |entity: &Entity| match entity {
        Entity::Int(v) => Some(*v),
        Entity::Bool(v) => Some(i64::from(*v)),
        _ => None,
    };
    let (Some(left), Some(right)) = (integral(a), integral(b)) else {
        return Err(type_error(Opcode::Rem, a, b));
    };
    if right == 0 {
        return Err(UmkaError::new(
            ErrorKind::Arithmetic,
            "integer remainder by zero",
        ));
    }
    Ok(Entity::Int(left.wrapping_rem(right)))
}

/// Comparisons return Bool. Cross-type numeric comparisons use the promotion
/// rule, string-string is lexicographic, unit equals only unit; everything
/// else is non-comparable.
pub fn compare(op: Opcode, a: &Entity, b: &Entity) -> UmkaResult<Entity> {
    let result = match op {
        Opcode::Eq => equals(op, a, b)?,
        Opcode::Neq => !equals(op, a, b)?,
        _ => {
            let ordering = order(op, a, b)?;
            match op {
                Opcode::Lt => ordering == std::cmp::Ordering::Less,
                Opcode::Lte => ordering != std::cmp::Ordering::Greater,
                Opcode::Gt => ordering == std::cmp::Ordering::Greater,
                Opcode::Gte => ordering != std::cmp::Ordering::Less,
                _ => unreachable!("non-comparison opcode {}", op.name()),
            }
        }
    };
    Ok(Entity::Bool(result))
}

fn equals(op: Opcode, a: &Entity, b: &Entity) -> UmkaResult<bool> {
    match (a, b) {
        (Entity::Str(left), Entity::Str(right)) => Ok(left == right),
        (Entity::Unit, Entity::Unit) => Ok(true),
        (Entity::Unit, _) | (_, Entity::Unit) => Ok(false),
        (Entity::Array(_), _) | (_, Entity::Array(_)) => Err(type_error(op, a, b)),
        _ => {
            let (Some(left), Some(right)) = (as_num(a), as_num(b)) else {
                return Err(type_error(op, a, b));
            };
            Ok(match (left, right) {
                (Num::Int(left), Num::Int(right)) => left == right,
                (left, right) => widen(left) == widen(right),
            })
        }
    }
}

fn order(op: Opcode, a: &Entity, b: &Entity) -> UmkaResult<std::cmp::Ordering> {
    match (a, b) {
        (Entity::Str(left), Entity::Str(right)) => Ok(left.cmp(right)),
        _ => {
            let (Some(left), Some(right)) = (as_num(a), as_num(b)) else {
                return Err(type_error(op, a, b));
            };
            match (left, right) {
                (Num::Int(left), Num::Int(right)) => Ok(left.cmp(&right)),
                (left, right) => widen(left)
                    .partial_cmp(&widen(right))
                    .ok_or_else(|| type_error(op, a, b)),
            }
        }
    }
}

/// Eager logical `&&` / `||`; both operands were evaluated by lowering.
pub fn logical(op: Opcode, a: &Entity, b: &Entity) -> Entity {
    let value = match op {
        Opcode::And => truthy(a) && truthy(b),
        Opcode::Or => truthy(a) || truthy(b),
        _ => unreachable!("non-logical opcode {}", op.name()),
    };
    Entity::Bool(value)
}

/// Non-zero numerics and non-empty strings are truthy; unit is falsy.
pub fn truthy(entity: &Entity) -> bool {
    match entity {
        Entity::Int(v) => *v != 0,
        Entity::Double(v) => *v != 0.0,
        Entity::Bool(v) => *v,
        Entity::Unit => false,
        Entity::Str(s) => !s.is_empty(),
        Entity::Array(_) => true,
    }
}

pub fn to_int(entity: &Entity) -> UmkaResult<Entity> {
    match entity {
        Entity::Int(v) => Ok(Entity::Int(*v)),
        Entity::Double(v) => Ok(Entity::Int(*v as i64)),
        Entity::Bool(v) => Ok(Entity::Int(i64::from(*v))),
        Entity::Str(s) => s.trim().parse::<i64>().map(Entity::Int).map_err(|_| {
            UmkaError::new(ErrorKind::Type, format!("cannot parse {s:?} as int"))
        }),
        other => Err(UmkaError::new(
            ErrorKind::Type,
            format!("cannot cast {} to int", other.type_name()),
        )),
    }
}

pub fn to_double(entity: &Entity) -> UmkaResult<Entity> {
    match entity {
        Entity::Int(v) => Ok(Entity::Double(*v as f64)),
        Entity::Double(v) => Ok(Entity::Double(*v)),
        Entity::Bool(v) => Ok(Entity::Double(if *v { 1.0 } else { 0.0 })),
        other => Err(UmkaError::new(
            ErrorKind::Type,
            format!("cannot cast {} to double", other.type_name()),
        )),
    }
}

/// Canonical string rendering; total over every entity. Array elements are
/// dereferenced through the heap; revisited arrays render as `[...]` so
/// cyclic structures terminate.
pub fn render(entity: &Entity, heap: &Heap) -> String {
    let mut seen = HashSet::new();
    render_inner(entity, heap, &mut seen)
}

fn render_inner(entity: &Entity, heap: &Heap, seen: &mut HashSet<usize>) -> String {
    match entity {
        Entity::Int(v) => v.to_string(),
        Entity::Double(v) => v.to_string(),
        Entity::Bool(v) => v.to_string(),
        Entity::Unit => "unit".to_string(),
        Entity::Str(s) => s.clone(),
        Entity::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for reference in items {
                let part = match heap.get(*reference) {
                    Some(element) => {
                        if matches!(element, Entity::Array(_)) && !seen.insert(reference.slot()) {
                            "[...]".to_string()
                        } else {
                            render_inner(element, heap, seen)
                        }
                    }
                    None => "<dangling>".to_string(),
                };
                parts.push(part);
            }
            format!("[{}]", parts.join(", "))
        }
    }
}
