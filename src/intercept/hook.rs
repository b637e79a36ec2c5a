use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Page-side function the hook reports through (`Runtime.addBinding`).
pub const PAGE_BINDING: &str = "__p2pRelayReport";

/// Wraps the page's `fetch` and `XMLHttpRequest` so every call still reaches
/// the original primitive untouched. Requests carrying an `Authorization`
/// header and responses from the query paths are reported to the binding.
/// Reporting failures are swallowed inside the page.
const HOOK_TEMPLATE: &str = r#"(() => {
  const report = window.__BINDING__;
  if (typeof report !== 'function' || window.__BINDING__Installed) return;
  window.__BINDING__Installed = true;
  const queryPaths = __QUERY_PATHS__;
  const send = (msg) => { try { report(JSON.stringify(msg)); } catch (_) {} };
  const isQuery = (url) => {
    const path = String(url || '').split(/[?#]/)[0];
    return queryPaths.some((p) => path.includes(p));
  };
  const reportHeaders = (url, headers) => {
    if (Object.keys(headers).some((k) => k.toLowerCase() === 'authorization')) {
      send({ kind: 'request', url: String(url || ''), headers });
    }
  };

  const originalFetch = window.fetch;
  if (typeof originalFetch === 'function') {
    window.fetch = function (input, init) {
      let url = '';
      try {
        url = typeof input === 'string' ? input : (input && input.url) || String(input);
        const headers = {};
        const source = (init && init.headers) || (input && input.headers);
        if (source) new Headers(source).forEach((v, k) => { headers[k] = v; });
        reportHeaders(url, headers);
      } catch (_) {}
      const pending = originalFetch.apply(this, arguments);
      try {
        pending.then((resp) => {
          const finalUrl = resp.url || url;
          if (!isQuery(finalUrl)) return;
          resp.clone().text().then((body) => send({ kind: 'response', url: finalUrl, body }), () => {});
        }, () => {});
      } catch (_) {}
      return pending;
    };
  }

  const proto = window.XMLHttpRequest && window.XMLHttpRequest.prototype;
  if (proto) {
    const open = proto.open;
    const setRequestHeader = proto.setRequestHeader;
    const xhrSend = proto.send;
    proto.open = function (method, url) {
      try { this.__BINDING__Url = String(url); this.__BINDING__Headers = {}; } catch (_) {}
      return open.apply(this, arguments);
    };
    proto.setRequestHeader = function (name, value) {
      try { if (this.__BINDING__Headers) this.__BINDING__Headers[name] = String(value); } catch (_) {}
      return setRequestHeader.apply(this, arguments);
    };
    proto.send = function () {
      try {
        const xhr = this;
        reportHeaders(xhr.__BINDING__Url, xhr.__BINDING__Headers || {});
        xhr.addEventListener('load', () => {
          try {
            const finalUrl = xhr.responseURL || xhr.__BINDING__Url;
            if ((xhr.responseType === '' || xhr.responseType === 'text') && isQuery(finalUrl)) {
              send({ kind: 'response', url: finalUrl, body: xhr.responseText });
            }
          } catch (_) {}
        });
      } catch (_) {}
      return xhrSend.apply(this, arguments);
    };
  }
})();"#;

/// Builds the page hook for the given query paths.
pub fn hook_script(query_paths: &[String]) -> String {
    let paths = Value::from(query_paths.to_vec()).to_string();
    HOOK_TEMPLATE
        .replace("__BINDING__", PAGE_BINDING)
        .replace("__QUERY_PATHS__", &paths)
}

/// One report sent by the page hook.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookReport {
    Request {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Response { url: String, body: String },
}

impl HookReport {
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}
