//! Native implementations of the fixed builtin table.
//!
//! The order here must match `compiler::BUILTINS`: `OpGetBuiltin <i>` at
//! compile time indexes into this same array at run time.

use std::rc::Rc;

use ecow::EcoString;

use crate::value::Value;

pub const BUILTINS: &[Value] = &[
    Value::Builtin(crate::value::Builtin { name: "len", func: len }),
    Value::Builtin(crate::value::Builtin { name: "first", func: first }),
    Value::Builtin(crate::value::Builtin { name: "last", func: last }),
    Value::Builtin(crate::value::Builtin { name: "rest", func: rest }),
    Value::Builtin(crate::value::Builtin { name: "push", func: push }),
];

fn len(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
        [Value::Array(items)] => Ok(Value::Int(items.len() as i64)),
        [other] => Err(format!("len: unsupported argument type '{}'", other.type_name())),
        _ => Err(format!("len: expected 1 argument, got {}", args.len())),
    }
}

fn first(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Array(items)] => Ok(items.first().cloned().unwrap_or(Value::Null)),
        [other] => Err(format!("first: unsupported argument type '{}'", other.type_name())),
        _ => Err(format!("first: expected 1 argument, got {}", args.len())),
    }
}

fn last(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Array(items)] => Ok(items.last().cloned().unwrap_or(Value::Null)),
        [other] => Err(format!("last: unsupported argument type '{}'", other.type_name())),
        _ => Err(format!("last: expected 1 argument, got {}", args.len())),
    }
}

fn rest(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Array(items)] => {
            if items.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Array(Rc::new(items[1..].to_vec())))
            }
        }
        [other] => Err(format!("rest: unsupported argument type '{}'", other.type_name())),
        _ => Err(format!("rest: expected 1 argument, got {}", args.len())),
    }
}

fn push(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Array(items), value] => {
            let mut next = (**items).clone();
            next.push(value.clone());
            Ok(Value::Array(Rc::new(next)))
        }
        [other, _] => Err(format!("push: unsupported argument type '{}'", other.type_name())),
        _ => Err(format!("push: expected 2 arguments, got {}", args.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_counts_chars_and_elements() {
        assert_eq!(len(&[Value::Str(EcoString::from("hi"))]), Ok(Value::Int(2)));
        assert_eq!(
            len(&[Value::Array(Rc::new(vec![Value::Int(1), Value::Int(2)]))]),
            Ok(Value::Int(2))
        );
    }

    #[test]
    fn first_last_rest_on_empty_array() {
        let empty = Value::Array(Rc::new(vec![]));
        assert_eq!(first(&[empty.clone()]), Ok(Value::Null));
        assert_eq!(last(&[empty.clone()]), Ok(Value::Null));
        assert_eq!(rest(&[empty]), Ok(Value::Null));
    }

    #[test]
    fn push_returns_a_new_array_leaving_the_original_untouched() {
        let original = Rc::new(vec![Value::Int(1)]);
        let result = push(&[Value::Array(original.clone()), Value::Int(2)]).unwrap();
        assert_eq!(original.len(), 1);
        match result {
            Value::Array(items) => assert_eq!(*items, vec![Value::Int(1), Value::Int(2)]),
            _ => panic!("expected an array"),
        }
    }
}
