//! Ambient helpers: colorized tracing.
//!
//! The spec's "re-entrant pool-level lock" falls out of the type system
//! instead of a hand-rolled runtime lock: [`crate::pmem::Pmem`] holds a raw
//! `*mut u8` into its mapping, which makes `Pool` `!Send`/`!Sync`
//! automatically, so a handle can only ever be driven by the thread that
//! already holds it, and every sub-collaborator's own `RefCell`/`Cell`
//! gives nested calls on that one thread the reentrancy the spec asks for
//! without any blocking at all.

/// Colorized trace of pool activity, gated behind the `verbose` feature.
#[macro_export]
macro_rules! trace {
    ($color:tt, $tag:expr, $msg:expr $(, $args:tt)*) => {
        #[cfg(feature = "verbose")] {
            use term_painter::Color::*;
            use term_painter::ToStyle;
            println!("{}", $color.paint(format!("{:>10}  {}", $tag, format!($msg $(, $args)*))));
        }
    };
}
