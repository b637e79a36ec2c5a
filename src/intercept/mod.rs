//! Network interception: the page request hook and the inspection helpers it
//! shares with the DevTools network listener.

pub mod hook;
pub mod inspect;
pub mod sniff;

pub use hook::{hook_script, HookReport, PAGE_BINDING};
pub use inspect::{Fetch, HttpRequest, HttpResponse, Inspector, ObservationTap, ReqwestTransport};
