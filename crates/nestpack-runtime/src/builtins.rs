//! Host symbols shipped with the launcher
//!
//! | Symbol          | Behavior                                              |
//! |-----------------|-------------------------------------------------------|
//! | `nestpack.echo` | Print the arguments, space separated                  |
//! | `nestpack.cat`  | Print each named resource found by the ambient loader |

use std::io::{self, Write};

use nestpack_core::context;
use nestpack_core::{Invocation, ProcedureError, SymbolTable};

pub const ECHO: &str = "nestpack.echo";
pub const CAT: &str = "nestpack.cat";

/// Register every builtin symbol into `symbols`.
pub fn register(symbols: &SymbolTable) {
    symbols.register(ECHO, echo);
    symbols.register(CAT, cat);
}

/// A symbol table holding only the builtins.
pub fn symbol_table() -> SymbolTable {
    let symbols = SymbolTable::new();
    register(&symbols);
    symbols
}

fn echo(invocation: &Invocation<'_>) -> Result<(), ProcedureError> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", invocation.args.join(" "))?;
    Ok(())
}

fn cat(invocation: &Invocation<'_>) -> Result<(), ProcedureError> {
    let loader = context::current_loader()
        .ok_or_else(|| ProcedureError::Failed("no ambient loader".to_string()))?;
    let mut out = io::stdout().lock();
    for name in invocation.args {
        let mut stream = loader
            .open_resource(name)?
            .ok_or_else(|| ProcedureError::Failed(format!("resource not found: {}", name)))?;
        io::copy(&mut stream, &mut out)?;
    }
    out.flush()?;
    Ok(())
}
