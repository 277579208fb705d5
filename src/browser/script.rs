//! 注入页面的 Delivery Agent 脚本与调用表达式

/// agent 不存在时桥接表达式返回的哨兵值
pub const MISSING: &str = "__wabulk_missing__";

/// 元素引用失效时 agent 返回的值
pub const STALE: &str = "stale";

/// 页面内 agent：元素以 `el-N` 引用登记，页面元素的匹配全部在这里完成
pub const AGENT_JS: &str = r#"
(function () {
  if (window.__wabulk && window.__wabulk.version === 1) return true;
  const refs = new Map();
  let seq = 0;

  function remember(el) {
    for (const [id, known] of refs) if (known === el) return id;
    const id = 'el-' + (++seq);
    refs.set(id, el);
    return id;
  }

  function lookup(id) {
    const el = refs.get(id);
    if (!el || !el.isConnected) { refs.delete(id); return null; }
    return el;
  }

  function textOf(el) {
    return (el.innerText || el.textContent || '').trim();
  }

  window.__wabulk = {
    version: 1,

    ping() { return true; },

    query(selectors) {
      for (const sel of selectors) {
        try {
          const el = document.querySelector(sel);
          if (el) return remember(el);
        } catch (e) {}
      }
      return null;
    },

    prompts() {
      const out = [];
      for (const el of document.querySelectorAll('button, a, div[role="button"]')) {
        const text = textOf(el);
        if (text && text.length < 160) out.push({ element: remember(el), text });
      }
      return out;
    },

    fill(id, segments) {
      const el = lookup(id);
      if (!el) return 'stale';
      el.focus();
      document.execCommand('selectAll', false, null);
      document.execCommand('delete', false, null);
      segments.forEach((seg, i) => {
        if (i > 0) document.execCommand('insertLineBreak');
        if (seg) document.execCommand('insertText', false, seg);
      });
      el.dispatchEvent(new InputEvent('input', { bubbles: true }));
      return 'ok';
    },

    press(id) {
      const el = lookup(id);
      if (!el) return 'stale';
      for (const type of ['mousedown', 'mouseup']) {
        el.dispatchEvent(new MouseEvent(type, { bubbles: true, cancelable: true, view: window }));
      }
      el.click();
      return 'ok';
    },

    enter(id) {
      const el = lookup(id);
      if (!el) return 'stale';
      el.focus();
      for (const type of ['keydown', 'keypress', 'keyup']) {
        el.dispatchEvent(new KeyboardEvent(type, {
          key: 'Enter', code: 'Enter', keyCode: 13, which: 13, bubbles: true, cancelable: true
        }));
      }
      return 'ok';
    },

    transcript(selectors, markers) {
      const seen = new Set();
      const out = [];
      for (const sel of selectors) {
        let nodes = [];
        try { nodes = document.querySelectorAll(sel); } catch (e) { continue; }
        for (const el of nodes) {
          if (seen.has(el)) continue;
          seen.add(el);
          const text = textOf(el);
          if (!text) continue;
          let outgoing = false;
          for (let p = el; p && p !== document.body; p = p.parentElement) {
            const cls = typeof p.className === 'string' ? p.className : '';
            if (markers.some(m => cls.includes(m))) { outgoing = true; break; }
          }
          out.push({ text, outgoing });
        }
      }
      return out;
    },

    changed(ms) {
      return new Promise(resolve => {
        const root = document.body || document.documentElement;
        const obs = new MutationObserver(() => { obs.disconnect(); clearTimeout(timer); resolve(true); });
        obs.observe(root, { childList: true, subtree: true, characterData: true });
        const timer = setTimeout(() => { obs.disconnect(); resolve(false); }, ms);
      });
    }
  };
  return true;
})()
"#;

/// 生成调用 agent 方法的表达式；结果统一 JSON 序列化为字符串
pub fn agent_call(method: &str, args: &[serde_json::Value]) -> String {
    let args = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
    format!(
        "(function () {{ if (!window.__wabulk) return Promise.resolve('{missing}'); \
         return Promise.resolve(window.__wabulk.{method}({args})).then(v => JSON.stringify(v)); }})()",
        missing = MISSING,
        method = method,
        args = args
    )
}
