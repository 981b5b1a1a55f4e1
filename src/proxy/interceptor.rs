//! Client-side runtime URL interceptor.
//!
//! Injected into every proxied HTML response. Server-side rewriting only
//! reaches URLs that exist as static text; this script catches the ones an
//! app assembles at runtime by patching `fetch`, `XMLHttpRequest`,
//! `WebSocket`, `EventSource` and the media `src` property setters. It is
//! best-effort by contract and must stay idempotent (guarded by
//! [`MARKER`]).

/// Presence of this identifier in a document means the interceptor is
/// already installed.
pub const MARKER: &str = "__muximuxProxy";

const TEMPLATE: &str = r#"(function () {
  if (window.__muximuxProxy) { return; }
  var prefix = "/proxy/__MUXIMUX_SLUG__";
  window.__muximuxProxy = prefix;

  function reroute(u) {
    if (typeof u !== "string" || u.length === 0) { return u; }
    if (u === prefix || u.indexOf(prefix + "/") === 0) { return u; }
    if (u.charAt(0) === "/" && u.indexOf("//") !== 0) { return prefix + u; }
    if (u.indexOf(location.origin + "/") === 0) {
      var tail = u.slice(location.origin.length);
      return tail.indexOf(prefix + "/") === 0 ? u : location.origin + prefix + tail;
    }
    return u;
  }

  var origFetch = window.fetch;
  if (origFetch) {
    window.fetch = function (input, init) {
      if (typeof input === "string") {
        input = reroute(input);
      } else if (input && typeof input.url === "string") {
        input = new Request(reroute(input.url), input);
      }
      return origFetch.call(this, input, init);
    };
  }

  var origOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, u) {
    arguments[1] = reroute(u);
    return origOpen.apply(this, arguments);
  };

  var OrigWS = window.WebSocket;
  if (OrigWS) {
    var wsBase = (location.protocol === "https:" ? "wss://" : "ws://") + location.host;
    var PatchedWS = function (u, protocols) {
      if (typeof u === "string") {
        if (u.charAt(0) === "/") {
          u = wsBase + reroute(u);
        } else {
          var m = u.match(/^wss?:\/\/([^/]+)(\/.*)?$/);
          if (m && m[1] === location.host) { u = wsBase + reroute(m[2] || "/"); }
        }
      }
      return protocols === undefined ? new OrigWS(u) : new OrigWS(u, protocols);
    };
    PatchedWS.prototype = OrigWS.prototype;
    PatchedWS.CONNECTING = OrigWS.CONNECTING;
    PatchedWS.OPEN = OrigWS.OPEN;
    PatchedWS.CLOSING = OrigWS.CLOSING;
    PatchedWS.CLOSED = OrigWS.CLOSED;
    window.WebSocket = PatchedWS;
  }

  var OrigES = window.EventSource;
  if (OrigES) {
    var PatchedES = function (u, cfg) {
      return cfg === undefined ? new OrigES(reroute(u)) : new OrigES(reroute(u), cfg);
    };
    PatchedES.prototype = OrigES.prototype;
    window.EventSource = PatchedES;
  }

  ["HTMLImageElement", "HTMLScriptElement", "HTMLSourceElement",
   "HTMLMediaElement", "HTMLTrackElement", "HTMLIFrameElement"].forEach(function (name) {
    var ctor = window[name];
    if (!ctor || !ctor.prototype) { return; }
    var desc = Object.getOwnPropertyDescriptor(ctor.prototype, "src");
    if (!desc || !desc.set || !desc.configurable) { return; }
    Object.defineProperty(ctor.prototype, "src", {
      get: desc.get,
      set: function (v) { desc.set.call(this, reroute(v)); },
      configurable: true,
      enumerable: desc.enumerable
    });
  });

  function nudgeFrozenImages() {
    var imgs = document.querySelectorAll("img");
    for (var i = 0; i < imgs.length; i++) {
      var img = imgs[i];
      if (img.complete && img.naturalWidth > 0) {
        var style = window.getComputedStyle(img);
        if (style && style.opacity === "0") { img.style.opacity = "1"; }
      }
    }
  }

  if (window.self !== window.top) {
    window.addEventListener("load", function () { setTimeout(nudgeFrozenImages, 1500); });
  }
})();"#;

/// The interceptor for one app, as a full `<script>` element.
pub fn script_tag(slug: &str) -> String {
    format!("<script>{}</script>", TEMPLATE.replace("__MUXIMUX_SLUG__", slug))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_parameterized_by_slug() {
        let tag = script_tag("sonarr");
        assert!(tag.starts_with("<script>"));
        assert!(tag.ends_with("</script>"));
        assert!(tag.contains("/proxy/sonarr"));
        assert!(!tag.contains("__MUXIMUX_SLUG__"));
    }

    #[test]
    fn script_carries_the_marker() {
        assert!(script_tag("x").contains(MARKER));
    }

    #[test]
    fn script_patches_the_runtime_surfaces() {
        let tag = script_tag("x");
        for surface in ["fetch", "XMLHttpRequest", "WebSocket", "EventSource"] {
            assert!(tag.contains(surface), "missing {surface} patch");
        }
    }
}
