use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::*;

pub fn derive_persistent(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident;

    let fields = match input.data {
        Data::Struct(DataStruct {
            fields: Fields::Named(ref fields),
            ..
        }) => fields.named.clone(),
        _ => abort_call_site!(
            "Persistent can only be derived for structs with named fields";
            help = "use a struct with named fields, e.g. `struct Foo { a: i64, b: String }`"
        ),
    };

    let field_idents: Vec<&Ident> = fields
        .iter()
        .map(|f| f.ident.as_ref().expect("named field"))
        .collect();
    let field_count = field_idents.len();

    let to_fields = field_idents.iter().map(|ident| {
        quote_spanned! {ident.span()=>
            pmemobj::codec::FieldCodec::persist_field(&self.#ident, pool)?
        }
    });

    let from_fields: Vec<TokenStream2> = field_idents
        .iter()
        .enumerate()
        .map(|(i, ident)| {
            quote_spanned! {ident.span()=>
                #ident: pmemobj::codec::FieldCodec::resurrect_field(pool, fields[#i])?
            }
        })
        .collect();

    let class_name = format!("{}", name);
    let expect_msg = format!(
        "{} has {} fields but {{}} OIDs were supplied",
        name, field_count
    );

    let expanded = quote! {
        #[automatically_derived]
        impl pmemobj::persistent::Persistent for #name {
            fn class_name() -> &'static str {
                #class_name
            }

            fn to_fields(&self, pool: &pmemobj::pool::Pool) -> pmemobj::error::Result<Vec<pmemobj::oid::Oid>> {
                Ok(vec![#(#to_fields),*])
            }

            fn from_fields(pool: &pmemobj::pool::Pool, fields: &[pmemobj::oid::Oid]) -> pmemobj::error::Result<Self> {
                if fields.len() != #field_count {
                    return Err(pmemobj::error::Error::internal(format!(#expect_msg, fields.len())));
                }
                Ok(Self {
                    #(#from_fields),*
                })
            }
        }
    };

    expanded.into()
}
