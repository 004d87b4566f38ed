use proc_macro::TokenStream;

extern crate proc_macro;
extern crate quote;
extern crate syn;

#[macro_use]
extern crate proc_macro_error;

mod persistent;

/// Derives `pmemobj::persistent::Persistent` for a struct with named fields.
///
/// Every field's type must implement `pmemobj::codec::FieldCodec`. The
/// generated impl stores the struct as a record body: an object header
/// followed by one `Oid` per field, in declaration order. The pool's
/// deallocator and garbage collector read that field array straight off
/// persistent memory, so a derived type is a full container for free,
/// the same way `PersistentList` is — no separate traversal method needed.
#[proc_macro_error]
#[proc_macro_derive(Persistent)]
pub fn derive_persistent(input: TokenStream) -> TokenStream {
    persistent::derive_persistent(input)
}
