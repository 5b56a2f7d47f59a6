use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, parse_quote, Type};

pub fn derive(tokens: proc_macro::TokenStream) -> TokenStream {
	let input: DeriveInput = match syn::parse(tokens) {
		Ok(input) => input,
		Err(err) => return err.to_compile_error(),
	};

	let Data::Enum(data) = &input.data else {
		return Error::new_spanned(&input.ident, "FromRepr only supports enums").to_compile_error();
	};

	if !input.generics.params.is_empty() {
		return Error::new_spanned(&input.generics, "FromRepr does not support generics").to_compile_error();
	}

	let mut repr: Type = parse_quote!(usize);
	for attr in &input.attrs {
		if attr.path().is_ident("repr") {
			match attr.parse_args::<Type>() {
				Ok(ty) => repr = ty,
				Err(err) => return err.to_compile_error(),
			}
		}
	}

	let mut cases = Vec::with_capacity(data.variants.len());
	for variant in &data.variants {
		let Some((_, discriminant)) = &variant.discriminant else {
			return Error::new_spanned(variant, "FromRepr requires explicit discriminants").to_compile_error();
		};
		let name = &variant.ident;
		cases.push(quote!(#discriminant => Some(Self::#name)));
	}

	let ident = &input.ident;
	quote! {
		impl #ident {
			pub fn from_repr(discriminant: #repr) -> Option<Self> {
				match discriminant {
					#(#cases,)*
					_ => None,
				}
			}
		}
	}
}
